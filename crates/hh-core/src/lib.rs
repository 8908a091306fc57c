//! Shared types for the HomeHelper orchestration core: manifests, app records,
//! health observations, configuration and the process/health adapter seams.

pub mod app;
pub mod config;
pub mod health;
pub mod manifest;
pub mod process;

pub use app::{AppRecord, AppRuntime, AppState, InteractiveRuntime, ServiceRuntime};
pub use config::{resolve_config_path, Config, ConfigError};
pub use health::{
    HealthGrade, HealthHistory, HealthProbe, HealthReport, HealthStatus, ProbeError, ProbeTarget,
    HEALTH_MESSAGE_MAX,
};
pub use manifest::{
    normalize_app_id, AppKind, AppManifest, Capabilities, Endpoints, FieldProblem,
    InstallDirectives, RestartPolicy, ValidationError, MANIFEST_FILE,
};
pub use process::{
    LaunchSpec, ProcessHandle, ProcessStatus, ProcessSupervisor, SpawnError, TerminateOutcome,
};

pub type AppId = String;
