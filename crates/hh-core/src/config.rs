use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for environment overrides (`HOMEHELPER_DATA_DIR`, `HOMEHELPER_UI_TTL_SECS`, ...).
pub const ENV_PREFIX: &str = "HOMEHELPER_";
const CONFIG_FILE: &str = "homehelper.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: `{value}`")]
    Override { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub apps_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub ports: PortsConfig,
    pub health: HealthConfig,
    pub restart: RestartConfig,
    pub lifecycle: LifecycleConfig,
    pub ui: UiConfig,
    pub broker: BrokerConfig,
    pub launch: LaunchConfig,
    pub registry: RegistryConfig,
    pub events: EventsConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("/opt/homehelper/apps"),
            data_dir: PathBuf::from("/opt/homehelper/data"),
            logs_dir: PathBuf::from("/opt/homehelper/logs"),
            ports: PortsConfig::default(),
            health: HealthConfig::default(),
            restart: RestartConfig::default(),
            lifecycle: LifecycleConfig::default(),
            ui: UiConfig::default(),
            broker: BrokerConfig::default(),
            launch: LaunchConfig::default(),
            registry: RegistryConfig::default(),
            events: EventsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
    pub interactive_port: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 8100,
            range_end: 8199,
            interactive_port: 8501,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub staleness_secs: u64,
    pub history_len: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_ms: 5_000,
            failure_threshold: 3,
            staleness_secs: 180,
            history_len: 20,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Probe timeout, kept strictly below the poll interval.
    pub fn probe_timeout(&self) -> Duration {
        let interval = self.interval();
        let timeout = Duration::from_millis(self.timeout_ms.max(1));
        if timeout < interval {
            timeout
        } else {
            interval.mul_f64(0.8)
        }
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub max_retries: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_secs: 60,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    pub start_grace_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_grace_secs: 10,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub ttl_secs: u64,
    pub sweep_secs: u64,
    pub terminate_grace_secs: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_secs: 5,
            terminate_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    /// Bridge core events to the broker and relay app events back from it.
    pub enabled: bool,
    /// Ceiling of the reconnect backoff, which starts at one second.
    pub reconnect_max_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            enabled: true,
            reconnect_max_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    pub interpreter: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub snapshot_debounce_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    pub source: String,
    pub recent_capacity: usize,
    pub bus_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            source: "homehelper".to_string(),
            recent_capacity: 100,
            bus_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the config file (explicit path, `HOMEHELPER_CONFIG`, then the search path),
    /// applies environment overrides and validates the result.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(|| {
            std::env::var(format!("{ENV_PREFIX}CONFIG"))
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .or_else(|| resolve_config_path(CONFIG_FILE))
        });
        let mut config = match path.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok((config, path))
    }

    /// Applies `HOMEHELPER_*` overrides obtained from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (key, value))
        };

        if let Some((_, value)) = get("APPS_DIR") {
            self.apps_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = get("LOGS_DIR") {
            self.logs_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = get("BROKER_URL") {
            self.broker.url = value;
        }
        if let Some(pair) = get("BROKER_ENABLED") {
            self.broker.enabled = parse_override(pair)?;
        }
        if let Some((_, value)) = get("INTERPRETER") {
            self.launch.interpreter = value;
        }
        if let Some((_, value)) = get("BIND") {
            self.server.bind = value;
        }
        if let Some(pair) = get("PORT_RANGE_START") {
            self.ports.range_start = parse_override(pair)?;
        }
        if let Some(pair) = get("PORT_RANGE_END") {
            self.ports.range_end = parse_override(pair)?;
        }
        if let Some(pair) = get("INTERACTIVE_PORT") {
            self.ports.interactive_port = parse_override(pair)?;
        }
        if let Some(pair) = get("HEALTH_INTERVAL_SECS") {
            self.health.interval_secs = parse_override(pair)?;
        }
        if let Some(pair) = get("HEALTH_TIMEOUT_MS") {
            self.health.timeout_ms = parse_override(pair)?;
        }
        if let Some(pair) = get("HEALTH_FAILURE_THRESHOLD") {
            self.health.failure_threshold = parse_override(pair)?;
        }
        if let Some(pair) = get("UI_TTL_SECS") {
            self.ui.ttl_secs = parse_override(pair)?;
        }
        if let Some(pair) = get("UI_SWEEP_SECS") {
            self.ui.sweep_secs = parse_override(pair)?;
        }
        if let Some(pair) = get("RESTART_MAX_RETRIES") {
            self.restart.max_retries = parse_override(pair)?;
        }
        Ok(())
    }

    /// Rejects configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start == 0 || self.ports.range_end < self.ports.range_start {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.ports.interactive_port == 0 {
            return Err(ConfigError::Invalid("interactive port must be non-zero".into()));
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid("health interval must be non-zero".into()));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health failure threshold must be non-zero".into(),
            ));
        }
        if self.ui.ttl_secs == 0 || self.ui.sweep_secs == 0 {
            return Err(ConfigError::Invalid(
                "ui ttl and sweep interval must be non-zero".into(),
            ));
        }
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server bind `{}` is not a socket address",
                self.server.bind
            )));
        }
        Ok(())
    }

    pub fn registry_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("registry").join("apps.json")
    }

    pub fn port_map_path(&self) -> PathBuf {
        self.data_dir.join("registry").join("ports.json")
    }

    pub fn app_data_dir(&self, app_id: &str) -> PathBuf {
        self.data_dir.join(app_id)
    }

    pub fn app_log_file(&self, app_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{app_id}.log"))
    }
}

fn parse_override<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Override { key, value })
}

/// Finds a config file relative to `HOMEHELPER_CONFIG_DIR`, the working directory,
/// `configs/`, or the executable's directory.
pub fn resolve_config_path(rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return rel_path.exists().then(|| rel_path.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}CONFIG_DIR")) {
        if !dir.trim().is_empty() {
            candidates.push(PathBuf::from(dir));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("configs"));
        candidates.push(cwd);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.to_path_buf());
        }
    }

    candidates
        .into_iter()
        .map(|base| base.join(rel_path))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.ports.range_start, 8100);
        assert_eq!(config.ports.range_end, 8199);
        assert_eq!(config.ports.interactive_port, 8501);
        assert_eq!(config.ui.ttl_secs, 300);
        assert_eq!(
            config.registry_snapshot_path(),
            PathBuf::from("/opt/homehelper/data/registry/apps.json")
        );
    }

    #[test]
    fn toml_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homehelper.toml");
        std::fs::write(
            &path,
            r#"
apps_dir = "/srv/apps"

[ports]
range_start = 9000
range_end = 9010

[ui]
ttl_secs = 60
"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.apps_dir, PathBuf::from("/srv/apps"));
        assert_eq!(config.ports.range_start, 9000);
        assert_eq!(config.ports.interactive_port, 8501);
        assert_eq!(config.ui.ttl_secs, 60);
        assert_eq!(config.ui.sweep_secs, 5);
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HOMEHELPER_DATA_DIR", "/tmp/hh"),
            ("HOMEHELPER_UI_TTL_SECS", "42"),
            ("HOMEHELPER_BROKER_ENABLED", "false"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/hh"));
        assert_eq!(config.ui.ttl_secs, 42);
        assert!(!config.broker.enabled);

        let err = Config::default()
            .apply_overrides(|key| {
                (key == "HOMEHELPER_INTERACTIVE_PORT").then(|| "not-a-port".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { .. }));
    }

    #[test]
    fn empty_port_range_is_fatal() {
        let mut config = Config::default();
        config.ports.range_start = 9000;
        config.ports.range_end = 8999;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn probe_timeout_stays_below_interval() {
        let mut health = HealthConfig {
            interval_secs: 2,
            timeout_ms: 10_000,
            ..HealthConfig::default()
        };
        assert!(health.probe_timeout() < health.interval());
        health.timeout_ms = 500;
        assert_eq!(health.probe_timeout(), Duration::from_millis(500));
    }
}
