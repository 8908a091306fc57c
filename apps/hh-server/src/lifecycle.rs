use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use hh_core::config::{Config, RestartConfig};
use hh_core::{
    AppKind, AppRecord, AppState, HealthStatus, ProcessHandle, ProcessStatus, ProcessSupervisor,
    SpawnError, TerminateOutcome,
};
use hh_topics as topics;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::launch::LaunchContext;
use crate::ports::{PortAllocator, PortError};
use crate::registry::{AppRegistry, RegistryError};
use crate::router::EventRouter;

const CRASH_KILL_GRACE: Duration = Duration::from_secs(2);

/// Exponential restart delay: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms.max(1)),
            max: Duration::from_secs(config.max_delay_secs.max(1)),
            max_retries: config.max_retries,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleOptions {
    pub start_grace: Duration,
    pub stop_grace: Duration,
    pub failure_threshold: u32,
    pub backoff: Backoff,
    /// Refuse to start when something outside the core already listens on the port.
    pub check_port_bind: bool,
}

impl LifecycleOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_grace: Duration::from_secs(config.lifecycle.start_grace_secs),
            stop_grace: Duration::from_secs(config.lifecycle.stop_grace_secs),
            failure_threshold: config.health.failure_threshold.max(1),
            backoff: Backoff::from_config(&config.restart),
            check_port_bind: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("app `{0}` not found")]
    NotFound(String),
    #[error("app `{app_id}` is a {kind} app")]
    WrongKind { app_id: String, kind: &'static str },
    #[error("app `{0}` has no valid manifest")]
    InvalidManifest(String),
    #[error("app `{app_id}` is already {state}")]
    AlreadyRunning { app_id: String, state: AppState },
    #[error("app `{app_id}` is not running ({state})")]
    NotRunning { app_id: String, state: AppState },
    #[error("port unavailable for `{app_id}`: {reason}")]
    PortUnavailable { app_id: String, reason: String },
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
enum Trigger {
    User,
    Restart,
    AutoStart,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::User => "user",
            Trigger::Restart => "restart",
            Trigger::AutoStart => "auto_start",
        }
    }
}

/// What a single health observation did to the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    Healthy,
    Failing { consecutive: u32 },
    CrashDetected { exit_code: Option<i32> },
    Ignored,
}

/// Drives the service state machine. Same-app requests are serialised through per-app locks;
/// record state only moves through the registry's optimistic transitions.
pub struct ServiceManager {
    registry: Arc<AppRegistry>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<dyn ProcessSupervisor>,
    router: EventRouter,
    launch: LaunchContext,
    options: LifecycleOptions,
    handles: RwLock<HashMap<String, ProcessHandle>>,
    app_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pending_restarts: parking_lot::Mutex<HashMap<String, CancellationToken>>,
    poll_requests: mpsc::UnboundedSender<String>,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<AppRegistry>,
        ports: Arc<PortAllocator>,
        supervisor: Arc<dyn ProcessSupervisor>,
        router: EventRouter,
        launch: LaunchContext,
        options: LifecycleOptions,
        poll_requests: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ports,
            supervisor,
            router,
            launch,
            options,
            handles: RwLock::new(HashMap::new()),
            app_locks: parking_lot::Mutex::new(HashMap::new()),
            pending_restarts: parking_lot::Mutex::new(HashMap::new()),
            poll_requests,
        })
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        self.app_locks
            .lock()
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cancel_pending_restart(&self, app_id: &str) -> bool {
        match self.pending_restarts.lock().remove(app_id) {
            Some(token) => {
                token.cancel();
                debug!(target: "homehelper::lifecycle", app = %app_id, "pending restart cancelled");
                true
            }
            None => false,
        }
    }

    pub fn has_pending_restart(&self, app_id: &str) -> bool {
        self.pending_restarts.lock().contains_key(app_id)
    }

    async fn service_record(&self, app_id: &str) -> Result<AppRecord, LifecycleError> {
        let record = self
            .registry
            .get(app_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(app_id.to_string()))?;
        match record.kind() {
            Some(AppKind::Service) => Ok(record),
            Some(kind) => Err(LifecycleError::WrongKind {
                app_id: app_id.to_string(),
                kind: kind.as_str(),
            }),
            None => Err(LifecycleError::InvalidManifest(app_id.to_string())),
        }
    }

    /// Starts a service on request. Cancels any pending automatic restart.
    pub async fn start(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, LifecycleError> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        self.cancel_pending_restart(app_id);
        let record = self.service_record(app_id).await?;
        self.start_locked(record, Trigger::User).await
    }

    async fn start_locked(
        self: &Arc<Self>,
        record: AppRecord,
        trigger: Trigger,
    ) -> Result<AppRecord, LifecycleError> {
        let app_id = record.app_id.clone();
        let Some(manifest) = record.manifest.clone() else {
            return Err(LifecycleError::InvalidManifest(app_id));
        };
        // A failed stop leaves the process tracked; it has to be stopped before a new spawn.
        if !record.state.accepts_start() || self.handles.read().await.contains_key(&app_id) {
            return Err(LifecycleError::AlreadyRunning {
                app_id,
                state: record.state,
            });
        }

        let port = self.ensure_port(&record).await?;
        if self.options.check_port_bind && !port_is_free(port).await {
            return Err(LifecycleError::PortUnavailable {
                app_id,
                reason: format!("port {port} is already in use"),
            });
        }

        let starting = self
            .registry
            .transition_with(&app_id, record.state, AppState::Starting, |rec| {
                rec.port = port;
                rec.last_error = None;
                if let Some(service) = rec.service_runtime_mut() {
                    service.consecutive_failures = 0;
                    if trigger != Trigger::Restart {
                        service.restart_attempts = 0;
                    }
                }
            })
            .await?;

        if let Err(err) = self.launch.prepare_dirs(&manifest, &app_id).await {
            return Err(self
                .fail_start(&app_id, SpawnError::Io(err.to_string()))
                .await);
        }
        let spec = self.launch.service_spec(&starting, &manifest, port);
        let handle = match self.supervisor.spawn(spec).await {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail_start(&app_id, err).await),
        };

        self.handles
            .write()
            .await
            .insert(app_id.clone(), handle.clone());
        let record = self
            .registry
            .update(&app_id, |rec| {
                rec.pid = handle.pid;
                if let Some(service) = rec.service_runtime_mut() {
                    service.started_at = Some(Utc::now());
                    service.last_exit_code = None;
                }
            })
            .await?;
        info!(
            target: "homehelper::lifecycle",
            app = %app_id,
            port,
            pid = ?handle.pid,
            trigger = trigger.as_str(),
            "service starting"
        );
        self.router.emit(
            topics::EVENT_APP_STARTED,
            json!({
                "app_id": app_id,
                "port": port,
                "pid": handle.pid,
                "trigger": trigger.as_str(),
            }),
        );
        self.schedule_promotion(handle);
        Ok(record)
    }

    async fn ensure_port(&self, record: &AppRecord) -> Result<u16, LifecycleError> {
        let unavailable = |err: PortError| LifecycleError::PortUnavailable {
            app_id: record.app_id.clone(),
            reason: err.to_string(),
        };
        if record.port != 0 {
            match self.ports.reserve(&record.app_id, record.port).await {
                Ok(()) => return Ok(record.port),
                Err(PortError::Persist(reason)) => {
                    return Err(LifecycleError::PortUnavailable {
                        app_id: record.app_id.clone(),
                        reason,
                    })
                }
                Err(err) => warn!(
                    target: "homehelper::lifecycle",
                    app = %record.app_id,
                    port = record.port,
                    error = %err,
                    "recorded port no longer usable; reallocating"
                ),
            }
        }
        self.ports
            .allocate(&record.app_id, AppKind::Service)
            .await
            .map_err(unavailable)
    }

    async fn fail_start(&self, app_id: &str, err: SpawnError) -> LifecycleError {
        error!(
            target: "homehelper::lifecycle",
            app = %app_id,
            error = %err,
            "service launch failed"
        );
        let message = err.to_string();
        if let Err(conflict) = self
            .registry
            .transition_with(app_id, AppState::Starting, AppState::Failed, |rec| {
                rec.last_error = Some(message.clone());
                rec.pid = None;
            })
            .await
        {
            warn!(target: "homehelper::lifecycle", app = %app_id, error = %conflict, "could not park failed launch");
        }
        self.router.emit(
            topics::EVENT_APP_FAILED,
            json!({"app_id": app_id, "reason": message}),
        );
        LifecycleError::SpawnFailed {
            app_id: app_id.to_string(),
            source: err,
        }
    }

    /// After the start grace period, promotes `starting` to `running` and asks for the first
    /// health poll, or treats an already-dead process as a crash.
    fn schedule_promotion(self: &Arc<Self>, handle: ProcessHandle) {
        let manager = self.clone();
        let grace = self.options.start_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !manager.is_current(&handle).await {
                return;
            }
            match manager.supervisor.status(&handle).await {
                ProcessStatus::Running => {
                    match manager
                        .registry
                        .transition(&handle.app_id, AppState::Starting, AppState::Running)
                        .await
                    {
                        Ok(_) => {
                            info!(target: "homehelper::lifecycle", app = %handle.app_id, "service running");
                            if manager.poll_requests.send(handle.app_id.clone()).is_err() {
                                debug!(target: "homehelper::lifecycle", app = %handle.app_id, "health aggregator not listening");
                            }
                        }
                        Err(err) => debug!(
                            target: "homehelper::lifecycle",
                            app = %handle.app_id,
                            error = %err,
                            "promotion skipped"
                        ),
                    }
                }
                ProcessStatus::Exited { code } => {
                    manager.handle_crash(handle, code, "exited during startup").await;
                }
                ProcessStatus::Unknown => {
                    manager.handle_crash(handle, None, "process lost during startup").await;
                }
            }
        });
    }

    async fn is_current(&self, handle: &ProcessHandle) -> bool {
        self.handles
            .read()
            .await
            .get(&handle.app_id)
            .is_some_and(|current| current.instance == handle.instance)
    }

    /// Stops a service gracefully, forcing termination after the stop grace window.
    /// Cancels any pending restart.
    pub async fn stop(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, LifecycleError> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        let cancelled = self.cancel_pending_restart(app_id);
        let record = self.service_record(app_id).await?;
        let tracked = self.handles.read().await.contains_key(app_id);

        match record.state {
            AppState::Restarting | AppState::Crashed => {
                let handle = self.handles.write().await.remove(app_id);
                if let Some(handle) = handle {
                    self.terminate_quietly(&handle, CRASH_KILL_GRACE).await;
                }
                let stopped = self
                    .registry
                    .transition_with(app_id, record.state, AppState::Stopped, |rec| {
                        rec.pid = None;
                    })
                    .await?;
                info!(
                    target: "homehelper::lifecycle",
                    app = %app_id,
                    restart_cancelled = cancelled,
                    "service stopped while awaiting restart"
                );
                self.router.emit(
                    topics::EVENT_APP_STOPPED,
                    json!({"app_id": app_id, "outcome": "restart_cancelled"}),
                );
                return Ok(stopped);
            }
            AppState::Starting | AppState::Running => {}
            AppState::Error if tracked => {
                warn!(target: "homehelper::lifecycle", app = %app_id, "retrying termination");
            }
            state => {
                return Err(LifecycleError::NotRunning {
                    app_id: app_id.to_string(),
                    state,
                })
            }
        }

        self.registry
            .transition(app_id, record.state, AppState::Stopping)
            .await?;
        let handle = self.handles.write().await.remove(app_id);
        let outcome = match handle.as_ref() {
            Some(handle) => {
                self.supervisor
                    .terminate(handle, self.options.stop_grace)
                    .await
            }
            None => Ok(TerminateOutcome::AlreadyExited),
        };

        match outcome {
            Ok(outcome) => {
                let stopped = self
                    .registry
                    .transition_with(app_id, AppState::Stopping, AppState::Stopped, |rec| {
                        rec.pid = None;
                        if let Some(service) = rec.service_runtime_mut() {
                            service.consecutive_failures = 0;
                        }
                    })
                    .await?;
                info!(target: "homehelper::lifecycle", app = %app_id, ?outcome, "service stopped");
                self.router.emit(
                    topics::EVENT_APP_STOPPED,
                    json!({"app_id": app_id, "outcome": format!("{outcome:?}").to_lowercase()}),
                );
                Ok(stopped)
            }
            Err(err) => {
                error!(target: "homehelper::lifecycle", app = %app_id, error = %err, "service did not stop");
                let message = err.to_string();
                self.registry
                    .transition_with(app_id, AppState::Stopping, AppState::Error, |rec| {
                        rec.last_error = Some(message.clone());
                    })
                    .await?;
                if let Some(handle) = handle {
                    self.handles
                        .write()
                        .await
                        .insert(app_id.to_string(), handle);
                }
                self.router.emit(
                    topics::EVENT_APP_FAILED,
                    json!({"app_id": app_id, "reason": message}),
                );
                Err(LifecycleError::TerminateFailed {
                    app_id: app_id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Stop (when running) followed by start.
    pub async fn restart(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, LifecycleError> {
        match self.stop(app_id).await {
            Ok(_) | Err(LifecycleError::NotRunning { .. }) => {}
            Err(err) => return Err(err),
        }
        self.start(app_id).await
    }

    /// Starts every registered or stopped service whose manifest asks for auto start.
    pub async fn start_auto(self: &Arc<Self>) -> Vec<(String, Result<AppRecord, LifecycleError>)> {
        let candidates = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|record| record.is_service())
            .filter(|record| {
                record
                    .manifest
                    .as_ref()
                    .is_some_and(|manifest| manifest.capabilities.auto_start)
            })
            .filter(|record| matches!(record.state, AppState::Registered | AppState::Stopped))
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(candidates.len());
        for record in candidates {
            let app_id = record.app_id.clone();
            let lock = self.app_lock(&app_id);
            let _guard = lock.lock().await;
            let result = match self.registry.get(&app_id).await {
                Some(fresh) => self.start_locked(fresh, Trigger::AutoStart).await,
                None => Err(LifecycleError::NotFound(app_id.clone())),
            };
            if let Err(err) = &result {
                warn!(target: "homehelper::lifecycle", app = %app_id, error = %err, "auto start failed");
            }
            results.push((app_id, result));
        }
        results
    }

    /// Folds one health observation into the crash counter. Process exit is an immediate crash;
    /// `failure_threshold` consecutive failing polls are a crash as well.
    pub async fn observe(self: &Arc<Self>, app_id: &str, status: &HealthStatus) -> Observation {
        let Some(handle) = self.handles.read().await.get(app_id).cloned() else {
            return Observation::Ignored;
        };
        match self.supervisor.status(&handle).await {
            ProcessStatus::Exited { code } => {
                self.spawn_crash(handle, code, "process exited");
                return Observation::CrashDetected { exit_code: code };
            }
            ProcessStatus::Unknown => {
                self.spawn_crash(handle, None, "process lost");
                return Observation::CrashDetected { exit_code: None };
            }
            ProcessStatus::Running => {}
        }

        if status.grade.is_failure() {
            let updated = self
                .registry
                .update(app_id, |rec| {
                    if let Some(service) = rec.service_runtime_mut() {
                        service.consecutive_failures =
                            service.consecutive_failures.saturating_add(1);
                    }
                })
                .await;
            let consecutive = updated
                .ok()
                .and_then(|rec| rec.service_runtime().map(|s| s.consecutive_failures))
                .unwrap_or(0);
            debug!(
                target: "homehelper::lifecycle",
                app = %app_id,
                consecutive,
                threshold = self.options.failure_threshold,
                "health poll failed"
            );
            if consecutive >= self.options.failure_threshold {
                self.spawn_crash(handle, None, "health checks failing");
                return Observation::CrashDetected { exit_code: None };
            }
            Observation::Failing { consecutive }
        } else {
            if let Err(err) = self
                .registry
                .update(app_id, |rec| {
                    if let Some(service) = rec.service_runtime_mut() {
                        service.consecutive_failures = 0;
                        service.restart_attempts = 0;
                    }
                })
                .await
            {
                debug!(target: "homehelper::lifecycle", app = %app_id, error = %err, "health reset skipped");
            }
            Observation::Healthy
        }
    }

    fn spawn_crash(
        self: &Arc<Self>,
        handle: ProcessHandle,
        exit_code: Option<i32>,
        reason: &'static str,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.handle_crash(handle, exit_code, reason).await;
        });
    }

    async fn handle_crash(
        self: &Arc<Self>,
        handle: ProcessHandle,
        exit_code: Option<i32>,
        reason: &'static str,
    ) {
        let app_id = handle.app_id.clone();
        let lock = self.app_lock(&app_id);
        let _guard = lock.lock().await;
        if !self.is_current(&handle).await {
            return;
        }
        let Some(record) = self.registry.get(&app_id).await else {
            return;
        };
        if !matches!(record.state, AppState::Running | AppState::Starting) {
            return;
        }
        let crashed = match self
            .registry
            .transition_with(&app_id, record.state, AppState::Crashed, |rec| {
                rec.pid = None;
                rec.last_error = Some(reason.to_string());
                if let Some(service) = rec.service_runtime_mut() {
                    service.last_exit_code = exit_code;
                }
            })
            .await
        {
            Ok(record) => record,
            Err(err) => {
                debug!(target: "homehelper::lifecycle", app = %app_id, error = %err, "crash already handled");
                return;
            }
        };
        self.handles.write().await.remove(&app_id);
        self.terminate_quietly(&handle, CRASH_KILL_GRACE).await;

        warn!(
            target: "homehelper::lifecycle",
            app = %app_id,
            exit_code = ?exit_code,
            reason,
            "service crashed"
        );
        self.router.emit(
            topics::EVENT_APP_CRASHED,
            json!({"app_id": app_id, "exit_code": exit_code, "reason": reason}),
        );

        let policy = crashed
            .manifest
            .as_ref()
            .map(|manifest| manifest.capabilities.restart_policy)
            .unwrap_or_default();
        if !policy.restarts_after(exit_code) {
            info!(
                target: "homehelper::lifecycle",
                app = %app_id,
                policy = policy.as_str(),
                "restart policy declines restart"
            );
            return;
        }
        let attempt = crashed
            .service_runtime()
            .map(|service| service.restart_attempts)
            .unwrap_or(0)
            .saturating_add(1);
        self.schedule_restart(&app_id, attempt).await;
    }

    async fn schedule_restart(self: &Arc<Self>, app_id: &str, attempt: u32) {
        let backoff = &self.options.backoff;
        if attempt > backoff.max_retries {
            let message = format!("restart limit reached after {} attempts", backoff.max_retries);
            match self
                .registry
                .transition_with(app_id, AppState::Crashed, AppState::Failed, |rec| {
                    rec.last_error = Some(message.clone());
                })
                .await
            {
                Ok(_) => {
                    error!(target: "homehelper::lifecycle", app = %app_id, max_retries = backoff.max_retries, "service parked as failed");
                    self.router.emit(
                        topics::EVENT_APP_FAILED,
                        json!({
                            "app_id": app_id,
                            "reason": message,
                            "attempts": backoff.max_retries,
                        }),
                    );
                }
                Err(err) => debug!(target: "homehelper::lifecycle", app = %app_id, error = %err, "could not park service"),
            }
            return;
        }

        let delay = backoff.delay_for(attempt);
        let token = CancellationToken::new();
        self.pending_restarts
            .lock()
            .insert(app_id.to_string(), token.clone());
        if let Err(err) = self
            .registry
            .transition_with(app_id, AppState::Crashed, AppState::Restarting, |rec| {
                if let Some(service) = rec.service_runtime_mut() {
                    service.restart_attempts = attempt;
                }
            })
            .await
        {
            self.pending_restarts.lock().remove(app_id);
            debug!(target: "homehelper::lifecycle", app = %app_id, error = %err, "restart not scheduled");
            return;
        }
        info!(
            target: "homehelper::lifecycle",
            app = %app_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "service restart scheduled"
        );
        self.router.emit(
            topics::EVENT_APP_RESTARTING,
            json!({
                "app_id": app_id,
                "attempt": attempt,
                "max_retries": backoff.max_retries,
                "delay_ms": delay.as_millis() as u64,
            }),
        );

        let manager = self.clone();
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.run_restart(&app_id, token).await;
                }
            }
        });
    }

    async fn run_restart(self: &Arc<Self>, app_id: &str, token: CancellationToken) {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        if token.is_cancelled() {
            return;
        }
        self.pending_restarts.lock().remove(app_id);
        let Some(record) = self.registry.get(app_id).await else {
            return;
        };
        if record.state != AppState::Restarting {
            return;
        }
        if let Err(err) = self.start_locked(record, Trigger::Restart).await {
            warn!(target: "homehelper::lifecycle", app = %app_id, error = %err, "automatic restart failed");
        }
    }

    /// Stops a running service, releases its ports and removes the record.
    pub async fn uninstall(self: &Arc<Self>, app_id: &str) -> Result<AppRecord, LifecycleError> {
        let record = self
            .registry
            .get(app_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(app_id.to_string()))?;
        if record.is_service() {
            match self.stop(app_id).await {
                Ok(_) | Err(LifecycleError::NotRunning { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        let lock = self.app_lock(app_id);
        let _guard = lock.lock().await;
        self.cancel_pending_restart(app_id);
        let released = self.ports.release(app_id).await?;
        let removed = self
            .registry
            .remove(app_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(app_id.to_string()))?;
        self.app_locks.lock().remove(app_id);
        info!(target: "homehelper::lifecycle", app = %app_id, ?released, "app uninstalled");
        self.router.emit(
            topics::EVENT_APP_UNINSTALLED,
            json!({"app_id": app_id, "released_ports": released}),
        );
        Ok(removed)
    }

    async fn terminate_quietly(&self, handle: &ProcessHandle, grace: Duration) {
        if let Err(err) = self.supervisor.terminate(handle, grace).await {
            warn!(
                target: "homehelper::lifecycle",
                app = %handle.app_id,
                error = %err,
                "failed to terminate process"
            );
        }
    }

    /// Stops every service that owns a process and cancels pending restarts.
    pub async fn shutdown(self: &Arc<Self>) {
        let pending = self
            .pending_restarts
            .lock()
            .drain()
            .map(|(_, token)| token)
            .collect::<Vec<_>>();
        for token in pending {
            token.cancel();
        }
        let active = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|record| record.is_service() && record.state.owns_process())
            .map(|record| record.app_id)
            .collect::<Vec<_>>();
        let results = join_all(active.iter().map(|app_id| self.stop(app_id))).await;
        for (app_id, result) in active.iter().zip(results) {
            if let Err(err) = result {
                warn!(target: "homehelper::lifecycle", app = %app_id, error = %err, "service stop during shutdown failed");
            }
        }
    }
}

async fn port_is_free(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
