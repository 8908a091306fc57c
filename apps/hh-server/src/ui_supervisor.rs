use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hh_core::{
    AppKind, AppRecord, AppState, Config, ProcessHandle, ProcessStatus, ProcessSupervisor,
    SpawnError,
};
use hh_topics as topics;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::launch::LaunchContext;
use crate::ports::{PortAllocator, PortError};
use crate::registry::{AppRegistry, RegistryError};
use crate::router::EventRouter;
use crate::tasks::TaskHandle;

#[derive(Clone, Debug)]
pub struct UiOptions {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub terminate_grace: Duration,
}

impl UiOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: Duration::from_secs(config.ui.ttl_secs),
            sweep_interval: Duration::from_secs(config.ui.sweep_secs.max(1)),
            terminate_grace: Duration::from_secs(config.ui.terminate_grace_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UiError {
    #[error("app `{0}` not found")]
    NotFound(String),
    #[error("app `{app_id}` is a {kind} app")]
    WrongKind { app_id: String, kind: &'static str },
    #[error("app `{0}` has no valid manifest")]
    InvalidManifest(String),
    #[error("app `{0}` does not hold the interactive slot")]
    NotActive(String),
    #[error("failed to launch `{app_id}`: {source}")]
    SpawnFailed {
        app_id: String,
        #[source]
        source: SpawnError,
    },
    #[error("failed to stop `{app_id}`: {source}")]
    TerminateFailed {
        app_id: String,
        #[source]
        source: SpawnError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ports(#[from] PortError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Retire {
    Closed,
    Expired,
    Replaced,
    Shutdown,
}

impl Retire {
    fn as_str(&self) -> &'static str {
        match self {
            Retire::Closed => "closed",
            Retire::Expired => "expired",
            Retire::Replaced => "replaced",
            Retire::Shutdown => "shutdown",
        }
    }
}

/// What one sweep did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SweepAction {
    Idle,
    Expired(String),
    Exited(String),
    RetryFailed(String),
}

struct ActiveUi {
    app_id: String,
    handle: ProcessHandle,
    opened_at: DateTime<Utc>,
    deadline: Instant,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UiStatus {
    pub active: Option<String>,
    pub port: u16,
    pub ttl_secs: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub remaining_secs: Option<u64>,
}

/// Owns the single interactive slot. All operations hold the slot lock for their whole
/// duration, so at most one UI process exists at a time.
pub struct UiSupervisor {
    registry: Arc<AppRegistry>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<dyn ProcessSupervisor>,
    router: EventRouter,
    launch: LaunchContext,
    options: UiOptions,
    slot: Mutex<Option<ActiveUi>>,
}

impl UiSupervisor {
    pub fn new(
        registry: Arc<AppRegistry>,
        ports: Arc<PortAllocator>,
        supervisor: Arc<dyn ProcessSupervisor>,
        router: EventRouter,
        launch: LaunchContext,
        options: UiOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ports,
            supervisor,
            router,
            launch,
            options,
            slot: Mutex::new(None),
        })
    }

    async fn interactive_record(&self, app_id: &str) -> Result<AppRecord, UiError> {
        let record = self
            .registry
            .get(app_id)
            .await
            .ok_or_else(|| UiError::NotFound(app_id.to_string()))?;
        match record.kind() {
            Some(AppKind::Interactive) => Ok(record),
            Some(kind) => Err(UiError::WrongKind {
                app_id: app_id.to_string(),
                kind: kind.as_str(),
            }),
            None => Err(UiError::InvalidManifest(app_id.to_string())),
        }
    }

    /// Opens `app_id` on the interactive port, replacing whichever app holds it.
    /// Reopening the active app only resets its TTL.
    pub async fn open(&self, app_id: &str) -> Result<AppRecord, UiError> {
        let record = self.interactive_record(app_id).await?;
        let Some(manifest) = record.manifest.clone() else {
            return Err(UiError::InvalidManifest(app_id.to_string()));
        };
        let mut slot = self.slot.lock().await;

        if let Some(active) = slot.as_mut() {
            if active.app_id == app_id && record.state == AppState::Running {
                if self.supervisor.status(&active.handle).await == ProcessStatus::Running {
                    active.deadline = Instant::now() + self.options.ttl;
                    let refreshed = self
                        .registry
                        .update(app_id, |rec| {
                            if let Some(ui) = rec.interactive_runtime_mut() {
                                ui.last_touched = Some(Utc::now());
                            }
                        })
                        .await?;
                    debug!(target: "homehelper::ui", app = %app_id, "ui already open; ttl reset");
                    return Ok(refreshed);
                }
            }
        }

        if let Some(active) = slot.take() {
            let retire = if active.app_id == app_id {
                Retire::Closed
            } else {
                Retire::Replaced
            };
            if let Err((active, err)) = self.retire(active, retire).await {
                let holder = active.app_id.clone();
                *slot = Some(active);
                return Err(UiError::TerminateFailed {
                    app_id: holder,
                    source: err,
                });
            }
        }

        let port = self.ports.allocate(app_id, AppKind::Interactive).await?;
        let current = self
            .registry
            .get(app_id)
            .await
            .ok_or_else(|| UiError::NotFound(app_id.to_string()))?;
        let starting = self
            .registry
            .transition_with(app_id, current.state, AppState::Starting, |rec| {
                rec.port = port;
                rec.last_error = None;
            })
            .await?;

        let spawned = match self.launch.prepare_dirs(&manifest, app_id).await {
            Ok(()) => {
                self.supervisor
                    .spawn(self.launch.interactive_spec(&starting, &manifest, port))
                    .await
            }
            Err(err) => Err(SpawnError::Io(err.to_string())),
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                error!(target: "homehelper::ui", app = %app_id, error = %err, "ui launch failed");
                let message = err.to_string();
                self.registry
                    .transition_with(app_id, AppState::Starting, AppState::Failed, |rec| {
                        rec.port = 0;
                        rec.last_error = Some(message.clone());
                    })
                    .await?;
                self.ports.release_interactive(app_id).await?;
                self.router.emit(
                    topics::EVENT_APP_FAILED,
                    json!({"app_id": app_id, "reason": message}),
                );
                return Err(UiError::SpawnFailed {
                    app_id: app_id.to_string(),
                    source: err,
                });
            }
        };

        let opened_at = Utc::now();
        let record = self
            .registry
            .transition_with(app_id, AppState::Starting, AppState::Running, |rec| {
                rec.pid = handle.pid;
                if let Some(ui) = rec.interactive_runtime_mut() {
                    ui.opened_at = Some(opened_at);
                    ui.last_touched = Some(opened_at);
                }
            })
            .await?;
        *slot = Some(ActiveUi {
            app_id: app_id.to_string(),
            handle: handle.clone(),
            opened_at,
            deadline: Instant::now() + self.options.ttl,
        });
        info!(
            target: "homehelper::ui",
            app = %app_id,
            port,
            pid = ?handle.pid,
            ttl_secs = self.options.ttl.as_secs(),
            "ui opened"
        );
        self.router.emit(
            topics::EVENT_UI_OPENED,
            json!({"app_id": app_id, "port": port, "ttl_secs": self.options.ttl.as_secs()}),
        );
        Ok(record)
    }

    /// Pushes the TTL deadline of the active app forward.
    pub async fn keep_alive(&self, app_id: &str) -> Result<UiStatus, UiError> {
        {
            let mut slot = self.slot.lock().await;
            match slot.as_mut() {
                Some(active) if active.app_id == app_id => {
                    active.deadline = Instant::now() + self.options.ttl;
                }
                _ => return Err(UiError::NotActive(app_id.to_string())),
            }
        }
        self.registry
            .update(app_id, |rec| {
                if let Some(ui) = rec.interactive_runtime_mut() {
                    ui.last_touched = Some(Utc::now());
                }
            })
            .await?;
        Ok(self.status().await)
    }

    pub async fn close(&self, app_id: &str) -> Result<AppRecord, UiError> {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.take() else {
            return Err(UiError::NotActive(app_id.to_string()));
        };
        if active.app_id != app_id {
            *slot = Some(active);
            return Err(UiError::NotActive(app_id.to_string()));
        }
        match self.retire(active, Retire::Closed).await {
            Ok(record) => record.ok_or_else(|| UiError::NotFound(app_id.to_string())),
            Err((active, err)) => {
                *slot = Some(active);
                Err(UiError::TerminateFailed {
                    app_id: app_id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Expires the active app once its deadline passed and clears the slot when the
    /// process exited on its own.
    pub async fn sweep(&self) -> SweepAction {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.take() else {
            return SweepAction::Idle;
        };
        let app_id = active.app_id.clone();

        if Instant::now() >= active.deadline {
            return match self.retire(active, Retire::Expired).await {
                Ok(_) => SweepAction::Expired(app_id),
                Err((active, _)) => {
                    *slot = Some(active);
                    SweepAction::RetryFailed(app_id)
                }
            };
        }

        match self.supervisor.status(&active.handle).await {
            ProcessStatus::Running => {
                *slot = Some(active);
                SweepAction::Idle
            }
            status => {
                let code = match status {
                    ProcessStatus::Exited { code } => code,
                    _ => None,
                };
                warn!(target: "homehelper::ui", app = %app_id, exit_code = ?code, "ui process exited on its own");
                if let Err(err) = self.supervisor.terminate(&active.handle, Duration::ZERO).await {
                    debug!(target: "homehelper::ui", app = %app_id, error = %err, "reaping exited ui failed");
                }
                self.settle_stopped(&app_id, Some(format!("ui process exited ({code:?})")))
                    .await;
                self.router.emit(
                    topics::EVENT_UI_CLOSED,
                    json!({"app_id": app_id, "reason": "exited", "exit_code": code}),
                );
                SweepAction::Exited(app_id)
            }
        }
    }

    /// Terminates the slot holder. On failure the app is put in `error` and the active entry is
    /// handed back so the caller can keep the slot held.
    async fn retire(
        &self,
        active: ActiveUi,
        reason: Retire,
    ) -> Result<Option<AppRecord>, (ActiveUi, SpawnError)> {
        let app_id = active.app_id.clone();
        match self
            .supervisor
            .terminate(&active.handle, self.options.terminate_grace)
            .await
        {
            Ok(outcome) => {
                let record = self.settle_stopped(&app_id, None).await;
                let open_secs = (Utc::now() - active.opened_at).num_seconds().max(0);
                info!(
                    target: "homehelper::ui",
                    app = %app_id,
                    reason = reason.as_str(),
                    ?outcome,
                    open_secs,
                    "ui closed"
                );
                let event_type = match reason {
                    Retire::Expired => topics::EVENT_UI_EXPIRED,
                    _ => topics::EVENT_UI_CLOSED,
                };
                self.router.emit(
                    event_type,
                    json!({"app_id": app_id, "reason": reason.as_str(), "open_secs": open_secs}),
                );
                Ok(record)
            }
            Err(err) => {
                error!(
                    target: "homehelper::ui",
                    app = %app_id,
                    reason = reason.as_str(),
                    error = %err,
                    "ui process could not be terminated; slot stays held"
                );
                let message = err.to_string();
                if let Some(record) = self.registry.get(&app_id).await {
                    if let Err(conflict) = self
                        .registry
                        .transition_with(&app_id, record.state, AppState::Error, |rec| {
                            rec.last_error = Some(message.clone());
                        })
                        .await
                    {
                        debug!(target: "homehelper::ui", app = %app_id, error = %conflict, "error state not recorded");
                    }
                }
                Err((active, err))
            }
        }
    }

    /// Moves the record to `stopped` and frees the slot in the port map.
    async fn settle_stopped(&self, app_id: &str, last_error: Option<String>) -> Option<AppRecord> {
        if let Err(err) = self.ports.release_interactive(app_id).await {
            warn!(target: "homehelper::ui", app = %app_id, error = %err, "failed to free interactive slot");
        }
        let record = self.registry.get(app_id).await?;
        match self
            .registry
            .transition_with(app_id, record.state, AppState::Stopped, |rec| {
                rec.pid = None;
                rec.port = 0;
                rec.last_error = last_error;
            })
            .await
        {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(target: "homehelper::ui", app = %app_id, error = %err, "ui stop not recorded");
                self.registry.get(app_id).await
            }
        }
    }

    pub async fn status(&self) -> UiStatus {
        let slot = self.slot.lock().await;
        let now = Instant::now();
        UiStatus {
            active: slot.as_ref().map(|active| active.app_id.clone()),
            port: self.ports.interactive_port(),
            ttl_secs: self.options.ttl.as_secs(),
            opened_at: slot.as_ref().map(|active| active.opened_at),
            remaining_secs: slot
                .as_ref()
                .map(|active| active.deadline.saturating_duration_since(now).as_secs()),
        }
    }

    pub async fn active_app(&self) -> Option<String> {
        self.slot.lock().await.as_ref().map(|active| active.app_id.clone())
    }

    /// Closes the active app, if any.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.take() {
            if let Err((active, err)) = self.retire(active, Retire::Shutdown).await {
                warn!(target: "homehelper::ui", app = %active.app_id, error = %err, "ui left running at shutdown");
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> TaskHandle {
        let ui = self.clone();
        TaskHandle::new(
            "ui.sweeper",
            tokio::spawn(async move {
                let mut ticker = interval(ui.options.sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(target: "homehelper::ui", "ui sweeper cancelled");
                            break;
                        }
                        _ = ticker.tick() => {
                            match ui.sweep().await {
                                SweepAction::Idle => {}
                                SweepAction::RetryFailed(app_id) => warn!(
                                    target: "homehelper::ui",
                                    app = %app_id,
                                    "expired ui still running; retrying next sweep"
                                ),
                                action => debug!(target: "homehelper::ui", ?action, "ui sweep"),
                            }
                        }
                    }
                }
            }),
        )
    }
}
