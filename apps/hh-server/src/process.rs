use std::collections::HashMap;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hh_core::{
    LaunchSpec, ProcessHandle, ProcessStatus, ProcessSupervisor, SpawnError, TerminateOutcome,
};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const KILL_WAIT: Duration = Duration::from_secs(5);

struct ProcessInstance {
    instance: u64,
    child: Mutex<Child>,
    started_at: Instant,
}

/// Launches apps as child processes of the core.
pub struct LocalProcessSupervisor {
    processes: RwLock<HashMap<String, Arc<ProcessInstance>>>,
    next_instance: AtomicU64,
}

impl LocalProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            next_instance: AtomicU64::new(1),
        })
    }

    async fn lookup(&self, handle: &ProcessHandle) -> Option<Arc<ProcessInstance>> {
        self.processes
            .read()
            .await
            .get(&handle.app_id)
            .filter(|instance| instance.instance == handle.instance)
            .cloned()
    }

    async fn forget(&self, handle: &ProcessHandle) {
        let mut guard = self.processes.write().await;
        if guard
            .get(&handle.app_id)
            .is_some_and(|instance| instance.instance == handle.instance)
        {
            guard.remove(&handle.app_id);
        }
    }
}

fn log_stdio(spec: &LaunchSpec) -> Result<(Stdio, Stdio), SpawnError> {
    let Some(path) = spec.log_file.as_ref() else {
        return Ok((Stdio::null(), Stdio::null()));
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| SpawnError::Io(err.to_string()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| SpawnError::Io(format!("open {}: {err}", path.display())))?;
    let stderr = file
        .try_clone()
        .map_err(|err| SpawnError::Io(err.to_string()))?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[cfg(unix)]
fn request_exit(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a pid we spawned and SIGTERM has no memory-safety preconditions.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_exit(_pid: u32) -> bool {
    false
}

#[async_trait]
impl ProcessSupervisor for LocalProcessSupervisor {
    fn id(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, spec: LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let (stdout, stderr) = log_stdio(&spec)?;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|err| SpawnError::Launch(format!("{}: {err}", spec.program)))?;
        let pid = child.id();
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        self.processes.write().await.insert(
            spec.app_id.clone(),
            Arc::new(ProcessInstance {
                instance,
                child: Mutex::new(child),
                started_at: Instant::now(),
            }),
        );
        info!(
            target: "homehelper::process",
            app = %spec.app_id,
            pid = ?pid,
            program = %spec.program,
            "process spawned"
        );
        Ok(ProcessHandle {
            app_id: spec.app_id,
            instance,
            pid,
        })
    }

    async fn terminate(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<TerminateOutcome, SpawnError> {
        let Some(process) = self.lookup(handle).await else {
            return Ok(TerminateOutcome::AlreadyExited);
        };
        let mut child = process.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            drop(child);
            self.forget(handle).await;
            debug!(target: "homehelper::process", app = %handle.app_id, %status, "process already exited");
            return Ok(TerminateOutcome::AlreadyExited);
        }

        let signalled = child.id().map(request_exit).unwrap_or(false);
        if signalled {
            if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
                drop(child);
                self.forget(handle).await;
                if let Err(err) = result {
                    warn!(target: "homehelper::process", app = %handle.app_id, error = %err, "wait after SIGTERM failed");
                }
                return Ok(TerminateOutcome::Graceful);
            }
            warn!(
                target: "homehelper::process",
                app = %handle.app_id,
                grace_ms = grace.as_millis() as u64,
                "process ignored SIGTERM; killing"
            );
        }

        child
            .start_kill()
            .map_err(|err| SpawnError::Terminate(err.to_string()))?;
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(_) => {
                drop(child);
                self.forget(handle).await;
                Ok(TerminateOutcome::Forced)
            }
            Err(_) => Err(SpawnError::Terminate(format!(
                "process for {} did not exit after kill",
                handle.app_id
            ))),
        }
    }

    async fn status(&self, handle: &ProcessHandle) -> ProcessStatus {
        let Some(process) = self.lookup(handle).await else {
            return ProcessStatus::Unknown;
        };
        let mut child = process.child.lock().await;
        match child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => {
                debug!(
                    target: "homehelper::process",
                    app = %handle.app_id,
                    uptime_secs = process.started_at.elapsed().as_secs(),
                    %status,
                    "process exit observed"
                );
                ProcessStatus::Exited {
                    code: status.code(),
                }
            }
            Err(err) => {
                warn!(target: "homehelper::process", app = %handle.app_id, error = %err, "try_wait failed");
                ProcessStatus::Unknown
            }
        }
    }
}
