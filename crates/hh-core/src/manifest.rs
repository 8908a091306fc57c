use std::collections::BTreeMap;
use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// File name of the manifest every app directory carries.
pub const MANIFEST_FILE: &str = "homehelper.json";

const NAME_MAX: usize = 50;
const DESCRIPTION_MAX: usize = 200;
const AUTHOR_MAX: usize = 100;
const DEFAULT_MAIN_FILE: &str = "main.py";
const DEFAULT_HEALTH_PATH: &str = "/health";
const DEFAULT_UI_PATH: &str = "/ui";

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "version",
    "description",
    "author",
    "type",
    "kind",
    "main_file",
    "config",
    "install",
];

const KNOWN_CONFIG_FIELDS: &[&str] = &[
    "has_UI",
    "has_ui",
    "redis_required",
    "broker_required",
    "needs_broker",
    "data_dir",
    "needs_data_dir",
    "logs_dir",
    "needs_logs_dir",
    "auto_start",
    "restart_policy",
    "health_path",
    "ui_path",
];

static APP_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("app id pattern"));

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    Service,
    Interactive,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Service => "service",
            AppKind::Interactive => "interactive",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "service" => Some(AppKind::Service),
            "interactive" | "streamlit" | "ui" => Some(AppKind::Interactive),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "always" => Some(RestartPolicy::Always),
            "on-failure" => Some(RestartPolicy::OnFailure),
            "never" | "no" => Some(RestartPolicy::Never),
            _ => None,
        }
    }

    /// Whether a crash with the given exit code should be followed by a restart.
    /// An unknown exit code (process still alive but unhealthy) counts as a failure.
    pub fn restarts_after(&self, exit_code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != Some(0),
            RestartPolicy::Never => false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub needs_broker: bool,
    pub needs_data_dir: bool,
    pub needs_logs_dir: bool,
    pub has_ui: bool,
    pub auto_start: bool,
    pub restart_policy: RestartPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    pub health_path: String,
    #[serde(default)]
    pub ui_path: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            ui_path: None,
        }
    }
}

/// Setup steps declared by the app. Carried verbatim; the core never executes them.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallDirectives {
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub kind: AppKind,
    pub main_file: String,
    pub capabilities: Capabilities,
    pub endpoints: Endpoints,
    #[serde(default)]
    pub install: InstallDirectives,
    /// Unknown top-level fields, kept for forward compatibility.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
    /// Unknown keys inside `config`, handed through untouched.
    #[serde(default)]
    pub config_extra: BTreeMap<String, Value>,
}

impl AppManifest {
    /// Parses and validates manifest bytes. Reports every problem found, not just the first.
    pub fn parse(bytes: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| {
            ValidationError::single("manifest", format!("invalid JSON: {err}"))
        })?;
        let Value::Object(map) = value else {
            return Err(ValidationError::single(
                "manifest",
                "manifest must be a JSON object",
            ));
        };
        let mut problems = Vec::new();
        let manifest = from_map(map, &mut problems);
        match manifest {
            Some(manifest) if problems.is_empty() => Ok(manifest),
            _ => Err(ValidationError { problems }),
        }
    }

    /// Like [`AppManifest::parse`], additionally checking that the entry file exists
    /// inside `app_dir`.
    pub fn parse_in_dir(bytes: &[u8], app_dir: &Path) -> Result<Self, ValidationError> {
        let parsed = Self::parse(bytes);
        let main_file = match &parsed {
            Ok(manifest) => Some(manifest.main_file.clone()),
            Err(_) => main_file_hint(bytes),
        };
        let mut problems = match parsed {
            Ok(ref _manifest) => Vec::new(),
            Err(ref err) => err.problems.clone(),
        };
        if let Some(main_file) = main_file {
            if is_safe_relative(&main_file) && !app_dir.join(&main_file).is_file() {
                problems.push(FieldProblem::new(
                    "main_file",
                    format!("{main_file} not found in {}", app_dir.display()),
                ));
            }
        }
        match parsed {
            Ok(manifest) if problems.is_empty() => Ok(manifest),
            _ => Err(ValidationError { problems }),
        }
    }

    /// Compares the fields that determine how the app is launched and supervised.
    /// Cosmetic fields (description, author, passthrough extras in either bag) are ignored.
    pub fn same_contract(&self, other: &AppManifest) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.kind == other.kind
            && self.main_file == other.main_file
            && self.capabilities == other.capabilities
            && self.endpoints == other.endpoints
            && self.install == other.install
    }
}

fn from_map(mut map: Map<String, Value>, problems: &mut Vec<FieldProblem>) -> Option<AppManifest> {
    let name = required_string(&map, "name", NAME_MAX, problems);
    let description = required_string(&map, "description", DESCRIPTION_MAX, problems);
    let author = required_string(&map, "author", AUTHOR_MAX, problems);

    let version = required_string(&map, "version", usize::MAX, problems).and_then(|raw| {
        match semver::Version::parse(&raw) {
            Ok(parsed) if parsed.pre.is_empty() && parsed.build.is_empty() => Some(raw),
            _ => {
                problems.push(FieldProblem::new(
                    "version",
                    format!("`{raw}` is not a semantic version (x.y.z)"),
                ));
                None
            }
        }
    });

    let kind_raw = map.get("type").or_else(|| map.get("kind"));
    let kind = match kind_raw {
        None | Some(Value::Null) => {
            problems.push(FieldProblem::new("type", "missing"));
            None
        }
        Some(Value::String(raw)) => match AppKind::from_slug(raw) {
            Some(kind) => Some(kind),
            None => {
                problems.push(FieldProblem::new(
                    "type",
                    format!("`{raw}` is not one of service, interactive"),
                ));
                None
            }
        },
        Some(_) => {
            problems.push(FieldProblem::new("type", "must be a string"));
            None
        }
    };

    let main_file = match map.get("main_file") {
        None | Some(Value::Null) => DEFAULT_MAIN_FILE.to_string(),
        Some(Value::String(raw)) if is_safe_relative(raw) => raw.clone(),
        Some(Value::String(raw)) => {
            problems.push(FieldProblem::new(
                "main_file",
                format!("`{raw}` must be a relative path inside the app directory"),
            ));
            raw.clone()
        }
        Some(_) => {
            problems.push(FieldProblem::new("main_file", "must be a string"));
            DEFAULT_MAIN_FILE.to_string()
        }
    };

    let (capabilities, endpoints, config_extra) = parse_config(map.get("config"), problems);
    let install = parse_install(map.get("install"), problems);

    for known in KNOWN_FIELDS {
        map.remove(*known);
    }
    let extra = map.into_iter().collect::<BTreeMap<_, _>>();

    Some(AppManifest {
        name: name?,
        version: version?,
        description: description?,
        author: author?,
        kind: kind?,
        main_file,
        capabilities,
        endpoints,
        install,
        extra,
        config_extra,
    })
}

fn parse_config(
    value: Option<&Value>,
    problems: &mut Vec<FieldProblem>,
) -> (Capabilities, Endpoints, BTreeMap<String, Value>) {
    let mut capabilities = Capabilities::default();
    let mut endpoints = Endpoints::default();
    let config = match value {
        None | Some(Value::Null) => return (capabilities, endpoints, BTreeMap::new()),
        Some(Value::Object(config)) => config,
        Some(_) => {
            problems.push(FieldProblem::new("config", "must be an object"));
            return (capabilities, endpoints, BTreeMap::new());
        }
    };
    let extra = config
        .iter()
        .filter(|(key, _)| !KNOWN_CONFIG_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<BTreeMap<_, _>>();

    capabilities.has_ui = flag(config, &["has_UI", "has_ui"], problems);
    capabilities.needs_broker = flag(
        config,
        &["redis_required", "broker_required", "needs_broker"],
        problems,
    );
    capabilities.needs_data_dir = flag(config, &["data_dir", "needs_data_dir"], problems);
    capabilities.needs_logs_dir = flag(config, &["logs_dir", "needs_logs_dir"], problems);
    capabilities.auto_start = flag(config, &["auto_start"], problems);

    match config.get("restart_policy") {
        None | Some(Value::Null) => {}
        Some(Value::String(raw)) => match RestartPolicy::from_slug(raw) {
            Some(policy) => capabilities.restart_policy = policy,
            None => problems.push(FieldProblem::new(
                "config.restart_policy",
                format!("`{raw}` is not one of always, on-failure, never"),
            )),
        },
        Some(_) => problems.push(FieldProblem::new("config.restart_policy", "must be a string")),
    }

    match config.get("health_path") {
        None | Some(Value::Null) => {}
        Some(Value::String(path)) if path.starts_with('/') => {
            endpoints.health_path = path.clone();
        }
        Some(_) => problems.push(FieldProblem::new(
            "config.health_path",
            "must be a string starting with `/`",
        )),
    }

    match config.get("ui_path") {
        None | Some(Value::Null) => {
            if capabilities.has_ui {
                endpoints.ui_path = Some(DEFAULT_UI_PATH.to_string());
            }
        }
        Some(Value::String(path)) if path.starts_with('/') => {
            endpoints.ui_path = Some(path.clone());
        }
        Some(_) => problems.push(FieldProblem::new(
            "config.ui_path",
            "must be a string starting with `/`",
        )),
    }

    (capabilities, endpoints, extra)
}

fn parse_install(value: Option<&Value>, problems: &mut Vec<FieldProblem>) -> InstallDirectives {
    let install = match value {
        None | Some(Value::Null) => return InstallDirectives::default(),
        Some(Value::Object(install)) => install,
        Some(_) => {
            problems.push(FieldProblem::new("install", "must be an object"));
            return InstallDirectives::default();
        }
    };
    let setup_commands = match install.get("setup_commands") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let commands = items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect::<Vec<_>>();
            if commands.len() != items.len() {
                problems.push(FieldProblem::new(
                    "install.setup_commands",
                    "every entry must be a string",
                ));
            }
            commands
        }
        Some(_) => {
            problems.push(FieldProblem::new(
                "install.setup_commands",
                "must be an array of strings",
            ));
            Vec::new()
        }
    };
    InstallDirectives { setup_commands }
}

fn required_string(
    map: &Map<String, Value>,
    field: &str,
    max_len: usize,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    match map.get(field) {
        None | Some(Value::Null) => {
            problems.push(FieldProblem::new(field, "missing"));
            None
        }
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            let len = trimmed.chars().count();
            if len == 0 {
                problems.push(FieldProblem::new(field, "must not be empty"));
                None
            } else if len > max_len {
                problems.push(FieldProblem::new(
                    field,
                    format!("longer than {max_len} characters"),
                ));
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(_) => {
            problems.push(FieldProblem::new(field, "must be a string"));
            None
        }
    }
}

fn flag(config: &Map<String, Value>, keys: &[&str], problems: &mut Vec<FieldProblem>) -> bool {
    for key in keys {
        match config.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Bool(value)) => return *value,
            Some(_) => {
                problems.push(FieldProblem::new(
                    format!("config.{key}"),
                    "must be a boolean",
                ));
                return false;
            }
        }
    }
    false
}

fn main_file_hint(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    match value.get("main_file") {
        Some(Value::String(raw)) => Some(raw.clone()),
        None | Some(Value::Null) => Some(DEFAULT_MAIN_FILE.to_string()),
        Some(_) => None,
    }
}

fn is_safe_relative(raw: &str) -> bool {
    let path = Path::new(raw);
    !raw.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Derives the stable app identifier from a directory name: lower-cased, with spaces
/// and underscores replaced by `-`. Returns `None` when the result is not a valid id.
pub fn normalize_app_id(dir_name: &str) -> Option<String> {
    let id = dir_name
        .trim()
        .to_lowercase()
        .replace([' ', '_'], "-");
    APP_ID_RE.is_match(&id).then_some(id)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldProblem {
    pub field: String,
    pub message: String,
}

impl FieldProblem {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid manifest: {}", summarize(.problems))]
pub struct ValidationError {
    pub problems: Vec<FieldProblem>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            problems: vec![FieldProblem::new(field, message)],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.problems.iter().any(|problem| problem.field == field)
    }
}

fn summarize(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(|problem| format!("{}: {}", problem.field, problem.message))
        .collect::<Vec<_>>()
        .join("; ")
}
