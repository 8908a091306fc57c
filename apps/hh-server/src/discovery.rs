use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hh_core::{normalize_app_id, AppKind, AppManifest, AppRecord, ValidationError, MANIFEST_FILE};
use hh_topics as topics;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ports::PortAllocator;
use crate::registry::AppRegistry;
use crate::router::EventRouter;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DiscoveryFailure {
    pub app_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SkippedDir {
    pub dir: String,
    pub reason: String,
}

/// Outcome of one scan.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    pub unchanged: Vec<String>,
    pub changed: Vec<String>,
    pub failed: Vec<DiscoveryFailure>,
    pub missing: Vec<String>,
    pub skipped: Vec<SkippedDir>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to read apps directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scans the apps directory and reconciles it into the registry. Rerunnable; a scan never
/// touches the state or process of an app that is already known.
pub struct Discovery {
    apps_dir: PathBuf,
    registry: Arc<AppRegistry>,
    ports: Arc<PortAllocator>,
    router: EventRouter,
    scan_lock: Mutex<()>,
}

impl Discovery {
    pub fn new(
        apps_dir: PathBuf,
        registry: Arc<AppRegistry>,
        ports: Arc<PortAllocator>,
        router: EventRouter,
    ) -> Self {
        Self {
            apps_dir,
            registry,
            ports,
            router,
            scan_lock: Mutex::new(()),
        }
    }

    pub async fn scan(&self) -> Result<DiscoveryReport, DiscoveryError> {
        let _scan = self.scan_lock.lock().await;
        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();

        for dir in self.candidate_dirs(&mut report).await? {
            let Some(dir_name) = dir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(app_id) = normalize_app_id(dir_name) else {
                report.skipped.push(SkippedDir {
                    dir: dir_name.to_string(),
                    reason: "directory name does not form a valid app id".into(),
                });
                continue;
            };
            if !seen.insert(app_id.clone()) {
                warn!(
                    target: "homehelper::discovery",
                    app = %app_id,
                    dir = %dir.display(),
                    "duplicate app id; directory skipped"
                );
                report.skipped.push(SkippedDir {
                    dir: dir_name.to_string(),
                    reason: format!("app id `{app_id}` already used by another directory"),
                });
                continue;
            }
            self.discover_one(&app_id, &dir, &mut report).await;
        }

        for record in self.registry.list().await {
            if !seen.contains(&record.app_id) {
                report.missing.push(record.app_id);
            }
        }
        if !report.missing.is_empty() {
            warn!(
                target: "homehelper::discovery",
                missing = ?report.missing,
                "registered apps without a directory"
            );
        }

        info!(
            target: "homehelper::discovery",
            dir = %self.apps_dir.display(),
            registered = report.registered.len(),
            unchanged = report.unchanged.len(),
            changed = report.changed.len(),
            failed = report.failed.len(),
            missing = report.missing.len(),
            "discovery complete"
        );
        self.router.emit(
            topics::EVENT_DISCOVERY_COMPLETED,
            json!({
                "registered": report.registered,
                "changed": report.changed,
                "failed": report.failed.iter().map(|f| f.app_id.as_str()).collect::<Vec<_>>(),
                "missing": report.missing,
                "unchanged": report.unchanged.len(),
            }),
        );
        Ok(report)
    }

    async fn candidate_dirs(
        &self,
        report: &mut DiscoveryReport,
    ) -> Result<Vec<PathBuf>, DiscoveryError> {
        let mut entries = match tokio::fs::read_dir(&self.apps_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    target: "homehelper::discovery",
                    dir = %self.apps_dir.display(),
                    "apps directory does not exist"
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(DiscoveryError::ReadDir {
                    path: self.apps_dir.clone(),
                    source,
                })
            }
        };
        let read_err = |source| DiscoveryError::ReadDir {
            path: self.apps_dir.clone(),
            source,
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let path = entry.path();
            if tokio::fs::try_exists(path.join(MANIFEST_FILE))
                .await
                .unwrap_or(false)
            {
                dirs.push(path);
            } else {
                debug!(target: "homehelper::discovery", dir = %name, "no manifest; skipped");
                report.skipped.push(SkippedDir {
                    dir: name,
                    reason: format!("no {MANIFEST_FILE}"),
                });
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn discover_one(&self, app_id: &str, dir: &Path, report: &mut DiscoveryReport) {
        let parsed = match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
            Ok(bytes) => AppManifest::parse_in_dir(&bytes, dir),
            Err(err) => Err(ValidationError::single(
                "manifest",
                format!("unreadable: {err}"),
            )),
        };
        let existing = self.registry.get(app_id).await;

        let manifest = match parsed {
            Ok(manifest) => manifest,
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    target: "homehelper::discovery",
                    app = %app_id,
                    problems = err.problems.len(),
                    error = %reason,
                    "manifest rejected"
                );
                self.record_failure(app_id, dir, existing, &reason).await;
                report.failed.push(DiscoveryFailure {
                    app_id: app_id.to_string(),
                    reason,
                });
                return;
            }
        };

        match existing {
            Some(record) => match record.manifest.as_ref() {
                Some(current) if current.same_contract(&manifest) => {
                    report.unchanged.push(app_id.to_string());
                }
                Some(_) => {
                    self.flag_changed(app_id).await;
                    report.changed.push(app_id.to_string());
                }
                None => {
                    self.register(app_id, dir, manifest, Some(record)).await;
                    report.registered.push(app_id.to_string());
                }
            },
            None => {
                self.register(app_id, dir, manifest, None).await;
                report.registered.push(app_id.to_string());
            }
        }
    }

    async fn register(
        &self,
        app_id: &str,
        dir: &Path,
        manifest: AppManifest,
        previous: Option<AppRecord>,
    ) {
        let kind = manifest.kind;
        let mut record = AppRecord::registered(app_id, dir.to_path_buf(), manifest);
        if let Some(previous) = previous {
            record.installed_at = previous.installed_at;
        }
        if kind == AppKind::Service {
            match self.ports.allocate(app_id, AppKind::Service).await {
                Ok(port) => record.port = port,
                Err(err) => {
                    warn!(
                        target: "homehelper::discovery",
                        app = %app_id,
                        error = %err,
                        "no port assigned at registration"
                    );
                    record.last_error = Some(err.to_string());
                }
            }
        }
        let port = record.port;
        self.registry.upsert(record).await;
        info!(
            target: "homehelper::discovery",
            app = %app_id,
            kind = kind.as_str(),
            port,
            "app registered"
        );
        self.router.emit(
            topics::EVENT_APP_REGISTERED,
            json!({"app_id": app_id, "kind": kind.as_str(), "port": port}),
        );
    }

    async fn flag_changed(&self, app_id: &str) {
        match self
            .registry
            .update(app_id, |rec| rec.needs_reinstall = true)
            .await
        {
            Ok(record) => {
                warn!(
                    target: "homehelper::discovery",
                    app = %app_id,
                    state = %record.state,
                    "manifest changed; reinstall required"
                );
                self.router.emit(
                    topics::EVENT_APP_MANIFEST_CHANGED,
                    json!({"app_id": app_id, "state": record.state.as_str()}),
                );
            }
            Err(err) => warn!(target: "homehelper::discovery", app = %app_id, error = %err, "could not flag manifest change"),
        }
    }

    async fn record_failure(
        &self,
        app_id: &str,
        dir: &Path,
        existing: Option<AppRecord>,
        reason: &str,
    ) {
        match existing {
            Some(record) if record.manifest.is_some() => {
                // A once-valid app keeps running on its loaded manifest.
                if let Err(err) = self
                    .registry
                    .update(app_id, |rec| {
                        rec.needs_reinstall = true;
                        rec.last_error = Some(reason.to_string());
                    })
                    .await
                {
                    warn!(target: "homehelper::discovery", app = %app_id, error = %err, "could not flag invalid manifest");
                }
            }
            Some(_) => {
                if let Err(err) = self
                    .registry
                    .update(app_id, |rec| rec.last_error = Some(reason.to_string()))
                    .await
                {
                    warn!(target: "homehelper::discovery", app = %app_id, error = %err, "could not update failed app");
                }
            }
            None => {
                self.registry
                    .upsert(AppRecord::invalid(app_id, dir.to_path_buf(), reason))
                    .await;
            }
        }
    }
}
