use std::sync::Arc;

use chrono::{DateTime, Utc};
use hh_core::Config;

use crate::discovery::Discovery;
use crate::health::HealthAggregator;
use crate::host::HostMonitor;
use crate::lifecycle::ServiceManager;
use crate::ports::PortAllocator;
use crate::registry::AppRegistry;
use crate::resources::ResourceProxy;
use crate::router::EventRouter;
use crate::ui_supervisor::UiSupervisor;

/// Shared handles for the HTTP layer and the shutdown path.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    registry: Arc<AppRegistry>,
    ports: Arc<PortAllocator>,
    events: EventRouter,
    lifecycle: Arc<ServiceManager>,
    ui: Arc<UiSupervisor>,
    health: Arc<HealthAggregator>,
    discovery: Arc<Discovery>,
    resources: Arc<ResourceProxy>,
    host: Arc<HostMonitor>,
    started_at: DateTime<Utc>,
}

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<AppRegistry>,
        ports: Arc<PortAllocator>,
        events: EventRouter,
        lifecycle: Arc<ServiceManager>,
        ui: Arc<UiSupervisor>,
        health: Arc<HealthAggregator>,
        discovery: Arc<Discovery>,
        resources: Arc<ResourceProxy>,
    ) -> Self {
        let host = Arc::new(HostMonitor::new(config.data_dir.clone()));
        Self {
            config,
            registry,
            ports,
            events,
            lifecycle,
            ui,
            health,
            discovery,
            resources,
            host,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn events(&self) -> &EventRouter {
        &self.events
    }

    pub fn lifecycle(&self) -> &Arc<ServiceManager> {
        &self.lifecycle
    }

    pub fn ui(&self) -> &Arc<UiSupervisor> {
        &self.ui
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn resources(&self) -> &Arc<ResourceProxy> {
        &self.resources
    }

    pub fn host(&self) -> &Arc<HostMonitor> {
        &self.host
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
