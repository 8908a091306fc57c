use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hh_core::{AppRecord, AppState};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};
use crate::tasks::TaskHandle;

const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("app `{0}` not found")]
    NotFound(String),
    #[error("app `{app_id}` is {actual}, expected {expected}")]
    Conflict {
        app_id: String,
        expected: AppState,
        actual: AppState,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    version: String,
    last_updated: DateTime<Utc>,
    apps: BTreeMap<String, AppRecord>,
}

/// How the registry came up at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Restored { apps: usize, reset: usize },
    Empty,
    Corrupt(String),
}

/// Authoritative store of app records. State changes go through [`AppRegistry::transition`];
/// every other field goes through [`AppRegistry::update`], which cannot touch `state`.
pub struct AppRegistry {
    store: RwLock<HashMap<String, AppRecord>>,
    snapshot_path: Option<PathBuf>,
    debounce: Duration,
    dirty: Notify,
}

impl AppRegistry {
    pub fn new(snapshot_path: Option<PathBuf>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(HashMap::new()),
            snapshot_path,
            debounce,
            dirty: Notify::new(),
        })
    }

    /// Reloads the snapshot. Records that claimed a live process are reset to `stopped`
    /// because this instance does not own those processes.
    pub async fn load(snapshot_path: PathBuf, debounce: Duration) -> (Arc<Self>, LoadOutcome) {
        let registry = Self::new(Some(snapshot_path.clone()), debounce);
        let outcome = match persist::read_json::<RegistrySnapshot>(&snapshot_path).await {
            Ok(Some(snapshot)) => {
                let mut reset = 0usize;
                let mut store = registry.store.write().await;
                for (id, mut record) in snapshot.apps {
                    if record.state.owns_process() {
                        record.state = AppState::Stopped;
                        record.pid = None;
                        reset += 1;
                    }
                    if record.is_interactive() {
                        record.port = 0;
                    }
                    store.insert(id, record);
                }
                info!(
                    target: "homehelper::registry",
                    path = %snapshot_path.display(),
                    apps = store.len(),
                    reset,
                    "registry snapshot restored"
                );
                LoadOutcome::Restored {
                    apps: store.len(),
                    reset,
                }
            }
            Ok(None) => {
                info!(
                    target: "homehelper::registry",
                    path = %snapshot_path.display(),
                    "no registry snapshot; discovery will populate"
                );
                LoadOutcome::Empty
            }
            Err(err) => {
                warn!(
                    target: "homehelper::registry",
                    path = %snapshot_path.display(),
                    error = %err,
                    "registry snapshot unreadable; rebuilding from discovery"
                );
                LoadOutcome::Corrupt(err.to_string())
            }
        };
        (registry, outcome)
    }

    pub async fn upsert(&self, mut record: AppRecord) {
        record.touch();
        let id = record.app_id.clone();
        self.store.write().await.insert(id, record);
        self.mark_dirty();
    }

    pub async fn get(&self, app_id: &str) -> Option<AppRecord> {
        self.store.read().await.get(app_id).cloned()
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        let mut records = self
            .store
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        records
    }

    pub async fn contains(&self, app_id: &str) -> bool {
        self.store.read().await.contains_key(app_id)
    }

    /// Moves `app_id` from `expected` to `new`. Fails with `Conflict` when another actor
    /// moved the record first.
    pub async fn transition(
        &self,
        app_id: &str,
        expected: AppState,
        new: AppState,
    ) -> Result<AppRecord, RegistryError> {
        self.transition_with(app_id, expected, new, |_| {}).await
    }

    /// Like [`AppRegistry::transition`], applying `apply` to the record in the same critical
    /// section. `apply` cannot change the state.
    pub async fn transition_with<F>(
        &self,
        app_id: &str,
        expected: AppState,
        new: AppState,
        apply: F,
    ) -> Result<AppRecord, RegistryError>
    where
        F: FnOnce(&mut AppRecord),
    {
        let updated = {
            let mut store = self.store.write().await;
            let record = store
                .get_mut(app_id)
                .ok_or_else(|| RegistryError::NotFound(app_id.to_string()))?;
            if record.state != expected {
                return Err(RegistryError::Conflict {
                    app_id: app_id.to_string(),
                    expected,
                    actual: record.state,
                });
            }
            apply(record);
            record.state = new;
            record.touch();
            record.clone()
        };
        debug!(
            target: "homehelper::registry",
            app = %app_id,
            from = %expected,
            to = %new,
            "state transition"
        );
        self.mark_dirty();
        Ok(updated)
    }

    /// Updates non-state fields of a record.
    pub async fn update<F>(&self, app_id: &str, apply: F) -> Result<AppRecord, RegistryError>
    where
        F: FnOnce(&mut AppRecord),
    {
        let updated = {
            let mut store = self.store.write().await;
            let record = store
                .get_mut(app_id)
                .ok_or_else(|| RegistryError::NotFound(app_id.to_string()))?;
            let state = record.state;
            apply(record);
            record.state = state;
            record.touch();
            record.clone()
        };
        self.mark_dirty();
        Ok(updated)
    }

    /// Removes a record. Only used for explicit uninstall.
    pub async fn remove(&self, app_id: &str) -> Option<AppRecord> {
        let removed = self.store.write().await.remove(app_id);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Writes the snapshot now.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        let snapshot = {
            let store = self.store.read().await;
            RegistrySnapshot {
                version: SNAPSHOT_VERSION.to_string(),
                last_updated: Utc::now(),
                apps: store
                    .iter()
                    .map(|(id, record)| (id.clone(), record.clone()))
                    .collect(),
            }
        };
        persist::write_json_atomic(path, &snapshot).await
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Spawns the debounced snapshot writer. A final flush happens on cancellation.
    pub fn spawn_persister(self: &Arc<Self>, cancel: CancellationToken) -> TaskHandle {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(err) = registry.flush().await {
                            warn!(target: "homehelper::registry", error = %err, "final registry snapshot failed");
                        }
                        break;
                    }
                    _ = registry.dirty.notified() => {
                        tokio::time::sleep(registry.debounce).await;
                        if let Err(err) = registry.flush().await {
                            warn!(target: "homehelper::registry", error = %err, "registry snapshot failed");
                        }
                    }
                }
            }
        });
        TaskHandle::new("registry.persister", handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{interactive_record, service_record};

    #[tokio::test]
    async fn transition_requires_expected_state() {
        let registry = AppRegistry::new(None, Duration::from_millis(10));
        registry.upsert(service_record("notes")).await;

        let record = registry
            .transition("notes", AppState::Registered, AppState::Starting)
            .await
            .unwrap();
        assert_eq!(record.state, AppState::Starting);

        let err = registry
            .transition("notes", AppState::Registered, AppState::Running)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                app_id: "notes".into(),
                expected: AppState::Registered,
                actual: AppState::Starting,
            }
        );
        assert!(matches!(
            registry
                .transition("missing", AppState::Registered, AppState::Starting)
                .await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_succeed_exactly_once() {
        for _ in 0..20 {
            let registry = AppRegistry::new(None, Duration::from_millis(10));
            registry.upsert(service_record("race")).await;
            let a = {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .transition("race", AppState::Registered, AppState::Starting)
                        .await
                })
            };
            let b = {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .transition("race", AppState::Registered, AppState::Stopped)
                        .await
                })
            };
            let results = [a.await.unwrap(), b.await.unwrap()];
            let ok = results.iter().filter(|r| r.is_ok()).count();
            let conflicts = results
                .iter()
                .filter(|r| matches!(r, Err(RegistryError::Conflict { .. })))
                .count();
            assert_eq!((ok, conflicts), (1, 1));
        }
    }

    #[tokio::test]
    async fn update_cannot_change_state() {
        let registry = AppRegistry::new(None, Duration::from_millis(10));
        registry.upsert(service_record("notes")).await;
        let record = registry
            .update("notes", |record| {
                record.port = 8100;
                record.state = AppState::Running;
            })
            .await
            .unwrap();
        assert_eq!(record.port, 8100);
        assert_eq!(record.state, AppState::Registered);
    }

    #[tokio::test]
    async fn snapshot_round_trip_resets_live_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry").join("apps.json");
        {
            let registry = AppRegistry::new(Some(path.clone()), Duration::from_millis(10));
            let mut running = service_record("svc");
            running.state = AppState::Running;
            running.port = 8100;
            running.pid = Some(4242);
            registry.upsert(running).await;
            let mut ui = interactive_record("dash");
            ui.state = AppState::Running;
            ui.port = 8501;
            registry.upsert(ui).await;
            registry.upsert(service_record("idle")).await;
            registry.flush().await.unwrap();
        }

        let (registry, outcome) = AppRegistry::load(path, Duration::from_millis(10)).await;
        assert_eq!(outcome, LoadOutcome::Restored { apps: 3, reset: 2 });
        let svc = registry.get("svc").await.unwrap();
        assert_eq!(svc.state, AppState::Stopped);
        assert_eq!(svc.port, 8100);
        assert_eq!(svc.pid, None);
        assert_eq!(registry.get("dash").await.unwrap().port, 0);
        assert_eq!(
            registry.get("idle").await.unwrap().state,
            AppState::Registered
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        tokio::fs::write(&path, b"{\"apps\": 12").await.unwrap();
        let (registry, outcome) = AppRegistry::load(path, Duration::from_millis(10)).await;
        assert!(matches!(outcome, LoadOutcome::Corrupt(_)));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn persister_writes_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        let registry = AppRegistry::new(Some(path.clone()), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let task = registry.spawn_persister(cancel.clone());
        registry.upsert(service_record("notes")).await;

        let written = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if path.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(written.is_ok(), "snapshot never written");
        cancel.cancel();
        let mut tasks = crate::tasks::TaskManager::new();
        tasks.push(task);
        tasks.shutdown_with_grace(Duration::from_secs(1)).await;
    }
}
