use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything needed to launch one app process.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    pub app_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// File receiving stdout/stderr, appended to.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Reference to a launched process. The supervisor that issued it owns the OS process.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub app_id: String,
    /// Distinguishes successive launches of the same app.
    pub instance: u64,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited { code: Option<i32> },
    /// The supervisor no longer tracks this handle.
    Unknown,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminateOutcome {
    Graceful,
    Forced,
    AlreadyExited,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("launch failure: {0}")]
    Launch(String),
    #[error("termination failed: {0}")]
    Terminate(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Boundary to whatever actually forks and monitors OS processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    fn id(&self) -> &'static str;

    async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle, SpawnError>;

    /// Asks the process to exit, escalating to a forced kill once `grace` elapses.
    async fn terminate(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<TerminateOutcome, SpawnError>;

    async fn status(&self, handle: &ProcessHandle) -> ProcessStatus;
}
