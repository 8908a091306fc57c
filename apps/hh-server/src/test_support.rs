//! Fixtures shared by the unit tests: records, fake process/probe/broker adapters and a fully wired
//! set of core components over a temporary directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use hh_core::config::PortsConfig;
use hh_core::{
    AppManifest, AppRecord, AppState, HealthProbe, HealthReport, LaunchSpec, ProbeError,
    ProbeTarget, ProcessHandle, ProcessStatus, ProcessSupervisor, SpawnError, TerminateOutcome,
    MANIFEST_FILE,
};
use hh_events::Bus;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerError, BrokerMessage};
use crate::health::{HealthAggregator, HealthOptions};
use crate::launch::LaunchContext;
use crate::lifecycle::{Backoff, LifecycleOptions, ServiceManager};
use crate::ports::PortAllocator;
use crate::registry::AppRegistry;
use crate::router::EventRouter;
use crate::ui_supervisor::{UiOptions, UiSupervisor};

pub fn manifest_json(kind: &str, config: Value) -> Value {
    json!({
        "name": "Fixture App",
        "version": "1.0.0",
        "description": "app used by tests",
        "author": "tests",
        "type": kind,
        "main_file": "main.py",
        "config": config,
    })
}

pub fn service_record_with(app_id: &str, manifest: Value) -> AppRecord {
    let bytes = serde_json::to_vec(&manifest).expect("manifest json");
    let manifest = AppManifest::parse(&bytes).expect("fixture manifest is valid");
    AppRecord::registered(app_id, PathBuf::from("/srv/apps").join(app_id), manifest)
}

pub fn service_record(app_id: &str) -> AppRecord {
    service_record_with(app_id, manifest_json("service", json!({})))
}

pub fn interactive_record(app_id: &str) -> AppRecord {
    service_record_with(app_id, manifest_json("interactive", json!({})))
}

/// Writes `<root>/<dir_name>/homehelper.json` (and `main.py` when asked) and returns the app dir.
pub fn write_app(root: &Path, dir_name: &str, manifest: &Value, with_main: bool) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).expect("app dir");
    std::fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(manifest).expect("manifest json"),
    )
    .expect("write manifest");
    if with_main {
        std::fs::write(dir.join("main.py"), "print('hi')\n").expect("write main");
    }
    dir
}

pub async fn wait_for_state(registry: &AppRegistry, app_id: &str, state: AppState) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.get(app_id).await.map(|r| r.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if waited.is_err() {
        let actual = registry.get(app_id).await.map(|r| r.state);
        panic!("{app_id} never reached {state}; last seen {actual:?}");
    }
}

#[derive(Default)]
struct FakeProcesses {
    alive: HashMap<u64, String>,
    exited: HashMap<u64, Option<i32>>,
    spawned: Vec<LaunchSpec>,
    max_alive: usize,
    fail_spawn: bool,
    fail_terminate: bool,
    spawn_delay: Duration,
}

/// In-memory process supervisor. Processes live until terminated or told to exit.
#[derive(Default)]
pub struct FakeSupervisor {
    state: parking_lot::Mutex<FakeProcesses>,
    next_instance: AtomicU64,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.state.lock().fail_spawn = fail;
    }

    pub fn fail_terminations(&self, fail: bool) {
        self.state.lock().fail_terminate = fail;
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        self.state.lock().spawn_delay = delay;
    }

    /// Makes the live process of `app_id` exit with `code`.
    pub fn exit(&self, app_id: &str, code: Option<i32>) {
        let mut state = self.state.lock();
        let instances = state
            .alive
            .iter()
            .filter(|(_, owner)| owner.as_str() == app_id)
            .map(|(instance, _)| *instance)
            .collect::<Vec<_>>();
        for instance in instances {
            state.alive.remove(&instance);
            state.exited.insert(instance, code);
        }
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().alive.len()
    }

    pub fn is_alive(&self, app_id: &str) -> bool {
        self.state.lock().alive.values().any(|owner| owner == app_id)
    }

    pub fn max_alive(&self) -> usize {
        self.state.lock().max_alive
    }

    pub fn spawn_count(&self, app_id: &str) -> usize {
        self.state
            .lock()
            .spawned
            .iter()
            .filter(|spec| spec.app_id == app_id)
            .count()
    }

    pub fn last_spec(&self, app_id: &str) -> Option<LaunchSpec> {
        self.state
            .lock()
            .spawned
            .iter()
            .rev()
            .find(|spec| spec.app_id == app_id)
            .cloned()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    fn id(&self) -> &'static str {
        "fake"
    }

    async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let delay = self.state.lock().spawn_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_spawn {
            return Err(SpawnError::Launch("interpreter missing".into()));
        }
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        state.alive.insert(instance, spec.app_id.clone());
        state.max_alive = state.max_alive.max(state.alive.len());
        let handle = ProcessHandle {
            app_id: spec.app_id.clone(),
            instance,
            pid: Some(40_000 + instance as u32),
        };
        state.spawned.push(spec);
        Ok(handle)
    }

    async fn terminate(
        &self,
        handle: &ProcessHandle,
        _grace: Duration,
    ) -> Result<TerminateOutcome, SpawnError> {
        let mut state = self.state.lock();
        if state.fail_terminate {
            return Err(SpawnError::Terminate("process refused to die".into()));
        }
        if state.alive.remove(&handle.instance).is_some() {
            return Ok(TerminateOutcome::Graceful);
        }
        state.exited.remove(&handle.instance);
        Ok(TerminateOutcome::AlreadyExited)
    }

    async fn status(&self, handle: &ProcessHandle) -> ProcessStatus {
        let state = self.state.lock();
        if state.alive.contains_key(&handle.instance) {
            ProcessStatus::Running
        } else if let Some(code) = state.exited.get(&handle.instance) {
            ProcessStatus::Exited { code: *code }
        } else {
            ProcessStatus::Unknown
        }
    }
}

#[derive(Clone, Debug)]
pub enum ProbeBehavior {
    Report(&'static str, &'static str),
    Fail(ProbeError),
    Hang,
}

/// Health probe answering from a per-app script; apps without one report `good`.
#[derive(Default)]
pub struct FakeProbe {
    behaviors: parking_lot::Mutex<HashMap<String, ProbeBehavior>>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, app_id: &str, behavior: ProbeBehavior) {
        self.behaviors.lock().insert(app_id.to_string(), behavior);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<HealthReport, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .get(&target.app_id)
            .cloned()
            .unwrap_or(ProbeBehavior::Report("good", "ok"));
        match behavior {
            ProbeBehavior::Report(health, message) => Ok(HealthReport {
                health: health.to_string(),
                message: message.to_string(),
                extra_info: None,
            }),
            ProbeBehavior::Fail(err) => Err(err),
            ProbeBehavior::Hang => std::future::pending().await,
        }
    }
}

/// In-memory pub/sub broker. Like a pattern subscription on the real broker, every published
/// message is also delivered back to the current subscribers.
#[derive(Default)]
pub struct FakeBroker {
    published: parking_lot::Mutex<Vec<BrokerMessage>>,
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<BrokerMessage>>>,
    fail_publish: AtomicBool,
    subscribe_calls: AtomicUsize,
    delivered: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published.lock().clone()
    }

    /// Sends a message from an app to every subscriber.
    pub fn deliver(&self, topic: &str, body: &Value) {
        let payload = serde_json::to_vec(body).expect("broker body");
        self.fan_out(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Messages handed to subscribers so far, app-sent and echoed alike.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Ends every open subscription stream, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    fn fan_out(&self, message: BrokerMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        self.delivered.fetch_add(subscribers.len(), Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connection refused".into()));
        }
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
        };
        self.published.lock().push(message.clone());
        self.fan_out(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        _pattern: &str,
    ) -> Result<BoxStream<'static, BrokerMessage>, BrokerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }
}

pub struct HarnessConfig {
    pub range: (u16, u16),
    pub interactive_port: u16,
    pub backoff: Backoff,
    pub start_grace: Duration,
    pub ui_ttl: Duration,
    pub ui_sweep: Duration,
    pub health_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            range: (9100, 9199),
            interactive_port: 9501,
            backoff: Backoff {
                base: Duration::from_millis(10),
                max: Duration::from_millis(40),
                max_retries: 4,
            },
            start_grace: Duration::from_millis(20),
            ui_ttl: Duration::from_secs(300),
            ui_sweep: Duration::from_millis(10),
            health_timeout: Duration::from_millis(100),
        }
    }
}

/// Core components wired over fakes.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub registry: Arc<AppRegistry>,
    pub ports: Arc<PortAllocator>,
    pub supervisor: Arc<FakeSupervisor>,
    pub probe: Arc<FakeProbe>,
    pub router: EventRouter,
    pub launch: LaunchContext,
    pub lifecycle: Arc<ServiceManager>,
    pub ui: Arc<UiSupervisor>,
    pub health: Arc<HealthAggregator>,
    poll_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(HarnessConfig::default()).await
    }

    pub async fn with_range(start: u16, end: u16) -> Self {
        Self::with_config(HarnessConfig {
            range: (start, end),
            ..HarnessConfig::default()
        })
        .await
    }

    pub async fn with_backoff(backoff: Backoff) -> Self {
        Self::with_config(HarnessConfig {
            backoff,
            ..HarnessConfig::default()
        })
        .await
    }

    pub async fn with_config(config: HarnessConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = AppRegistry::new(None, Duration::from_millis(10));
        let ports = Arc::new(PortAllocator::new(
            &PortsConfig {
                range_start: config.range.0,
                range_end: config.range.1,
                interactive_port: config.interactive_port,
            },
            None,
        ));
        let supervisor = FakeSupervisor::new();
        let probe = FakeProbe::new();
        let router = EventRouter::new(Bus::new(256), "homehelper", 100);
        let launch = LaunchContext {
            interpreter: "python3".into(),
            data_dir: dir.path().join("data"),
            logs_dir: dir.path().join("logs"),
            broker_url: "redis://localhost:6379/0".into(),
        };
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let lifecycle = ServiceManager::new(
            registry.clone(),
            ports.clone(),
            supervisor.clone(),
            router.clone(),
            launch.clone(),
            LifecycleOptions {
                start_grace: config.start_grace,
                stop_grace: Duration::from_millis(50),
                failure_threshold: 3,
                backoff: config.backoff,
                check_port_bind: false,
            },
            poll_tx,
        );
        let ui = UiSupervisor::new(
            registry.clone(),
            ports.clone(),
            supervisor.clone(),
            router.clone(),
            launch.clone(),
            UiOptions {
                ttl: config.ui_ttl,
                sweep_interval: config.ui_sweep,
                terminate_grace: Duration::from_millis(50),
            },
        );
        let health = HealthAggregator::new(
            registry.clone(),
            lifecycle.clone(),
            probe.clone(),
            router.clone(),
            HealthOptions {
                interval: Duration::from_secs(30),
                timeout: config.health_timeout,
                history_len: 20,
                staleness: Duration::from_secs(180),
            },
        );
        Self {
            dir,
            registry,
            ports,
            supervisor,
            probe,
            router,
            launch,
            lifecycle,
            ui,
            health,
            poll_rx: tokio::sync::Mutex::new(Some(poll_rx)),
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.lifecycle.options().backoff.clone()
    }

    pub async fn add_service(&self, app_id: &str, config: Value) -> AppRecord {
        self.add(app_id, manifest_json("service", config)).await
    }

    pub async fn add_interactive(&self, app_id: &str) -> AppRecord {
        self.add(app_id, manifest_json("interactive", json!({}))).await
    }

    async fn add(&self, app_id: &str, manifest: Value) -> AppRecord {
        let mut record = service_record_with(app_id, manifest);
        record.path = self.dir.path().join("apps").join(app_id);
        self.registry.upsert(record.clone()).await;
        record
    }

    pub async fn next_poll_request(&self) -> Option<String> {
        let mut guard = self.poll_rx.lock().await;
        let rx = guard.as_mut()?;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn take_poll_requests(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.poll_rx.lock().await.take()
    }
}
