use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use hh_core::Config;
use hh_events::Bus;
use hh_topics as topics;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api;
use crate::app_state::AppContext;
use crate::broker::{BrokerBridge, RedisBroker};
use crate::discovery::Discovery;
use crate::health::{HealthAggregator, HealthOptions, HttpHealthProbe};
use crate::launch::LaunchContext;
use crate::lifecycle::{LifecycleOptions, ServiceManager};
use crate::ports::{PortAllocator, PortMismatch};
use crate::process::LocalProcessSupervisor;
use crate::registry::{AppRegistry, LoadOutcome};
use crate::resources::ResourceProxy;
use crate::router::EventRouter;
use crate::tasks::TaskManager;
use crate::ui_supervisor::{UiOptions, UiSupervisor};

const HTTP_CONCURRENCY_LIMIT: usize = 256;
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct BootstrapOutput {
    pub router: axum::Router,
    pub state: AppContext,
    pub background_tasks: TaskManager,
    pub cancel: CancellationToken,
}

/// Restores persisted state, wires the components, discovers apps, auto-starts services
/// and spawns the background loops.
pub(crate) async fn build(config: Config) -> anyhow::Result<BootstrapOutput> {
    for dir in [&config.apps_dir, &config.data_dir, &config.logs_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create directory {}", dir.display()))?;
    }
    let config = Arc::new(config);

    let bus = Bus::new(config.events.bus_capacity);
    let events = EventRouter::new(
        bus,
        config.events.source.clone(),
        config.events.recent_capacity,
    );
    let cancel = CancellationToken::new();
    let mut background_tasks = TaskManager::new();
    if config.broker.enabled {
        let broker = RedisBroker::open(&config.broker.url).context("open event broker client")?;
        let bridge = BrokerBridge::new(Arc::new(broker), events.clone(), &config.broker);
        background_tasks.extend(bridge.spawn(cancel.clone()));
        info!(target: "homehelper::bootstrap", url = %config.broker.url, "event broker bridge started");
    }

    let (registry, outcome) = AppRegistry::load(
        config.registry_snapshot_path(),
        Duration::from_millis(config.registry.snapshot_debounce_ms),
    )
    .await;
    if let LoadOutcome::Corrupt(reason) = &outcome {
        events.emit(topics::EVENT_REGISTRY_REBUILT, json!({ "reason": reason }));
    }

    let ports = Arc::new(PortAllocator::load(&config.ports, config.port_map_path()).await);
    let mismatches = ports
        .reconcile(&registry.list().await)
        .await
        .context("reconcile port map with registry")?;
    apply_port_mismatches(&registry, &events, &mismatches).await;

    let launch = LaunchContext::from_config(&config);
    let supervisor = LocalProcessSupervisor::new();
    let (poll_tx, poll_rx) = mpsc::unbounded_channel();
    let lifecycle = ServiceManager::new(
        registry.clone(),
        ports.clone(),
        supervisor.clone(),
        events.clone(),
        launch.clone(),
        LifecycleOptions::from_config(&config),
        poll_tx,
    );
    let ui = UiSupervisor::new(
        registry.clone(),
        ports.clone(),
        supervisor,
        events.clone(),
        launch,
        UiOptions::from_config(&config),
    );
    let probe = HttpHealthProbe::new(config.health.probe_timeout())
        .context("build health probe client")?;
    let health = HealthAggregator::new(
        registry.clone(),
        lifecycle.clone(),
        Arc::new(probe),
        events.clone(),
        HealthOptions::from_config(&config),
    );
    let discovery = Arc::new(Discovery::new(
        config.apps_dir.clone(),
        registry.clone(),
        ports.clone(),
        events.clone(),
    ));
    let resources = Arc::new(
        ResourceProxy::new(config.health.probe_timeout().max(Duration::from_secs(5)))
            .context("build resource proxy client")?,
    );

    let report = discovery.scan().await.context("initial app discovery")?;
    info!(
        target: "homehelper::bootstrap",
        registered = report.registered.len(),
        unchanged = report.unchanged.len(),
        changed = report.changed.len(),
        failed = report.failed.len(),
        "initial discovery finished"
    );
    let orphans = ports
        .release_orphans(&registry.list().await)
        .await
        .context("release ports of unknown apps")?;
    apply_port_mismatches(&registry, &events, &orphans).await;
    let auto = lifecycle.start_auto().await;
    if !auto.is_empty() {
        info!(
            target: "homehelper::bootstrap",
            attempted = auto.len(),
            started = auto.iter().filter(|(_, result)| result.is_ok()).count(),
            "auto-start finished"
        );
    }

    background_tasks.push(registry.spawn_persister(cancel.clone()));
    background_tasks.push(ui.spawn_sweeper(cancel.clone()));
    background_tasks.push(health.spawn(cancel.clone(), poll_rx));

    let state = AppContext::new(
        config,
        registry,
        ports,
        events.clone(),
        lifecycle,
        ui,
        health,
        discovery,
        resources,
    );
    events.emit(
        topics::EVENT_SYSTEM_STARTED,
        json!({ "apps": state.registry().list().await.len() }),
    );
    let router = attach_http_layers(api::router(state.clone()));
    Ok(BootstrapOutput {
        router,
        state,
        background_tasks,
        cancel,
    })
}

/// Records take the port the allocator settled on; released orphans only raise the event.
async fn apply_port_mismatches(
    registry: &AppRegistry,
    events: &EventRouter,
    mismatches: &[PortMismatch],
) {
    for mismatch in mismatches {
        let resolved = mismatch.resolved_port;
        if let Err(err) = registry
            .update(&mismatch.app_id, |rec| {
                if rec.is_service() {
                    rec.port = resolved;
                }
            })
            .await
        {
            debug!(target: "homehelper::bootstrap", app = %mismatch.app_id, error = %err, "mismatch has no record");
        }
        events.emit(
            topics::EVENT_PORT_MISMATCH,
            serde_json::to_value(mismatch).unwrap_or_else(|_| json!({ "app_id": mismatch.app_id })),
        );
    }
}

pub(crate) fn attach_http_layers(router: axum::Router) -> axum::Router {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(HTTP_CONCURRENCY_LIMIT))
}

/// Closes the UI, stops services, writes the final snapshot and drains the background tasks.
pub(crate) async fn shutdown(
    state: &AppContext,
    background_tasks: TaskManager,
    cancel: CancellationToken,
) {
    info!(target: "homehelper::bootstrap", "stopping apps");
    state.ui().shutdown().await;
    state.lifecycle().shutdown().await;
    state.events().emit(topics::EVENT_SYSTEM_STOPPING, json!({}));
    if let Err(err) = state.registry().flush().await {
        warn!(target: "homehelper::bootstrap", error = %err, "final registry snapshot failed");
    }
    cancel.cancel();
    background_tasks.shutdown_with_grace(TASK_SHUTDOWN_GRACE).await;
}
