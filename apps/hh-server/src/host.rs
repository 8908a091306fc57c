use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::debug;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = MIB * 1024.0;
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CpuStats {
    pub usage_percent: f64,
    pub cores: usize,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct MemoryStats {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DiskStats {
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct HostStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    /// Filesystem holding the data directory.
    pub disk: Option<DiskStats>,
    pub temperature_celsius: Option<f64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProcessStats {
    pub app_id: String,
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub memory_percent: f64,
    pub uptime_secs: u64,
    pub status: String,
}

/// Host and per-app process metrics. CPU figures are measured between consecutive
/// snapshots, so the first snapshot after startup reports 0% for every process.
pub struct HostMonitor {
    system: Arc<Mutex<System>>,
    disk_path: PathBuf,
}

impl HostMonitor {
    pub fn new(disk_path: PathBuf) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            disk_path,
        }
    }

    /// Samples the host and the given `(app_id, pid)` processes. Pids that no longer exist
    /// are left out.
    pub async fn snapshot(&self, pids: Vec<(String, u32)>) -> (HostStats, Vec<ProcessStats>) {
        let system = self.system.clone();
        let disk_path = self.disk_path.clone();
        let sampled =
            tokio::task::spawn_blocking(move || sample(&mut system.lock(), &disk_path, &pids))
                .await;
        let (mut host, processes) = match sampled {
            Ok(sampled) => sampled,
            Err(err) => {
                debug!(target: "homehelper::resources", error = %err, "host sampling task failed");
                (HostStats::default(), Vec::new())
            }
        };
        host.temperature_celsius = read_temperature().await;
        (host, processes)
    }
}

fn sample(
    system: &mut System,
    disk_path: &Path,
    pids: &[(String, u32)],
) -> (HostStats, Vec<ProcessStats>) {
    system.refresh_cpu_usage();
    system.refresh_memory();
    let wanted = pids
        .iter()
        .map(|(_, pid)| Pid::from_u32(*pid))
        .collect::<Vec<_>>();
    if !wanted.is_empty() {
        system.refresh_processes(ProcessesToUpdate::Some(&wanted), true);
    }

    let load = System::load_average();
    let total_memory = system.total_memory();
    let host = HostStats {
        cpu: CpuStats {
            usage_percent: round1(system.global_cpu_usage() as f64),
            cores: system.cpus().len(),
            load_avg_1m: round2(load.one),
            load_avg_5m: round2(load.five),
            load_avg_15m: round2(load.fifteen),
        },
        memory: MemoryStats {
            total_mb: to_mb(total_memory),
            used_mb: to_mb(system.used_memory()),
            available_mb: to_mb(system.available_memory()),
            percent: percent(system.used_memory(), total_memory),
        },
        disk: disk_for(disk_path),
        temperature_celsius: None,
    };

    let processes = pids
        .iter()
        .filter_map(|(app_id, pid)| {
            let process = system.process(Pid::from_u32(*pid))?;
            Some(ProcessStats {
                app_id: app_id.clone(),
                pid: *pid,
                cpu_percent: round1(process.cpu_usage() as f64),
                memory_mb: to_mb(process.memory()),
                memory_percent: percent(process.memory(), total_memory),
                uptime_secs: process.run_time(),
                status: process.status().to_string().to_lowercase(),
            })
        })
        .collect();
    (host, processes)
}

fn disk_for(path: &Path) -> Option<DiskStats> {
    let disks = Disks::new_with_refreshed_list();
    let mounts = disks
        .list()
        .iter()
        .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space()))
        .collect::<Vec<_>>();
    best_mount(path, &mounts)
}

/// The disk with the longest mount point that contains `path`.
fn best_mount(path: &Path, mounts: &[(&Path, u64, u64)]) -> Option<DiskStats> {
    let (mount, total, available) = mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())?;
    let used = total.saturating_sub(*available);
    Some(DiskStats {
        mount_point: mount.display().to_string(),
        total_gb: round1(*total as f64 / GIB),
        used_gb: round1(used as f64 / GIB),
        free_gb: round1(*available as f64 / GIB),
        percent: percent(used, *total),
    })
}

async fn read_temperature() -> Option<f64> {
    let raw = tokio::fs::read_to_string(THERMAL_ZONE).await.ok()?;
    parse_millidegrees(&raw)
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    let millis = raw.trim().parse::<i64>().ok()?;
    Some(round1(millis as f64 / 1000.0))
}

fn to_mb(bytes: u64) -> u64 {
    (bytes as f64 / MIB) as u64
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round1(part as f64 / whole as f64 * 100.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
