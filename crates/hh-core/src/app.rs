use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HealthHistory;
use crate::manifest::{AppKind, AppManifest};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Restarting,
    Failed,
    Error,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Registered => "registered",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
            AppState::Crashed => "crashed",
            AppState::Restarting => "restarting",
            AppState::Failed => "failed",
            AppState::Error => "error",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            AppState::Registered => "Registered",
            AppState::Starting => "Starting",
            AppState::Running => "Running",
            AppState::Stopping => "Stopping",
            AppState::Stopped => "Stopped",
            AppState::Crashed => "Crashed",
            AppState::Restarting => "Restarting",
            AppState::Failed => "Failed",
            AppState::Error => "Error",
        }
    }

    /// States in which the core believes it owns a live (or about to be live) process.
    pub fn owns_process(&self) -> bool {
        matches!(
            self,
            AppState::Starting | AppState::Running | AppState::Stopping | AppState::Restarting
        )
    }

    /// States from which an explicit start request is accepted.
    pub fn accepts_start(&self) -> bool {
        matches!(
            self,
            AppState::Registered
                | AppState::Stopped
                | AppState::Failed
                | AppState::Crashed
                | AppState::Error
                | AppState::Restarting
        )
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRuntime {
    /// Restart attempts since the app was last healthy or explicitly started.
    pub restart_attempts: u32,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractiveRuntime {
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_touched: Option<DateTime<Utc>>,
}

/// Kind-specific runtime payload of a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppRuntime {
    Service(ServiceRuntime),
    Interactive(InteractiveRuntime),
    /// The manifest never validated, so the kind is not known.
    Unresolved,
}

impl AppRuntime {
    pub fn for_kind(kind: AppKind) -> Self {
        match kind {
            AppKind::Service => AppRuntime::Service(ServiceRuntime::default()),
            AppKind::Interactive => AppRuntime::Interactive(InteractiveRuntime::default()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    pub app_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub manifest: Option<AppManifest>,
    pub state: AppState,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub health: HealthHistory,
    pub runtime: AppRuntime,
    pub installed_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub needs_reinstall: bool,
}

impl AppRecord {
    /// A freshly discovered app with a valid manifest.
    pub fn registered(app_id: impl Into<String>, path: PathBuf, manifest: AppManifest) -> Self {
        let now = Utc::now();
        Self {
            app_id: app_id.into(),
            path,
            runtime: AppRuntime::for_kind(manifest.kind),
            manifest: Some(manifest),
            state: AppState::Registered,
            port: 0,
            pid: None,
            health: HealthHistory::default(),
            installed_at: now,
            registered_at: now,
            updated_at: now,
            last_error: None,
            needs_reinstall: false,
        }
    }

    /// A discovered app whose manifest could not be validated.
    pub fn invalid(app_id: impl Into<String>, path: PathBuf, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            app_id: app_id.into(),
            path,
            manifest: None,
            state: AppState::Failed,
            port: 0,
            pid: None,
            health: HealthHistory::default(),
            runtime: AppRuntime::Unresolved,
            installed_at: now,
            registered_at: now,
            updated_at: now,
            last_error: Some(reason.into()),
            needs_reinstall: false,
        }
    }

    pub fn kind(&self) -> Option<AppKind> {
        self.manifest.as_ref().map(|manifest| manifest.kind)
    }

    pub fn is_service(&self) -> bool {
        self.kind() == Some(AppKind::Service)
    }

    pub fn is_interactive(&self) -> bool {
        self.kind() == Some(AppKind::Interactive)
    }

    pub fn service_runtime(&self) -> Option<&ServiceRuntime> {
        match &self.runtime {
            AppRuntime::Service(runtime) => Some(runtime),
            _ => None,
        }
    }

    pub fn service_runtime_mut(&mut self) -> Option<&mut ServiceRuntime> {
        match &mut self.runtime {
            AppRuntime::Service(runtime) => Some(runtime),
            _ => None,
        }
    }

    pub fn interactive_runtime_mut(&mut self) -> Option<&mut InteractiveRuntime> {
        match &mut self.runtime {
            AppRuntime::Interactive(runtime) => Some(runtime),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
