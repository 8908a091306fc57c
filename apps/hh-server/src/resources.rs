use std::time::Duration;

use hh_core::{AppRecord, AppState};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::http_client;

static RESOURCE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("resource name pattern"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("app `{0}` is not running")]
    NotRunning(String),
    #[error("app `{0}` does not expose a ui")]
    NoUi(String),
    #[error("`{0}` is not a valid resource name")]
    InvalidName(String),
    #[error("app answered HTTP {0}")]
    Upstream(u16),
    #[error("app unreachable: {0}")]
    Unreachable(String),
    #[error("app returned malformed data: {0}")]
    Malformed(String),
}

/// Passes resource requests through to a running service's own HTTP endpoints. Bodies are
/// returned unmodified; interpreting resource name prefixes is left to the presentation layer.
pub struct ResourceProxy {
    client: reqwest::Client,
}

impl ResourceProxy {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client::client_with_timeout(timeout)?,
        })
    }

    fn base(record: &AppRecord) -> Result<String, ResourceError> {
        if record.state != AppState::Running || record.port == 0 {
            return Err(ResourceError::NotRunning(record.app_id.clone()));
        }
        Ok(format!("http://127.0.0.1:{}", record.port))
    }

    /// `GET <ui_path>`: the names of the resources the app exposes.
    pub async fn list(&self, record: &AppRecord) -> Result<Vec<String>, ResourceError> {
        let ui_path = record
            .manifest
            .as_ref()
            .and_then(|manifest| manifest.endpoints.ui_path.clone())
            .ok_or_else(|| ResourceError::NoUi(record.app_id.clone()))?;
        let url = format!("{}{}", Self::base(record)?, ui_path);
        let body = self.get_json(&url).await?;
        serde_json::from_value::<Vec<String>>(body)
            .map_err(|err| ResourceError::Malformed(err.to_string()))
    }

    /// `GET /api/{resource}` or `GET /api/{resource}/{item}`.
    pub async fn fetch(
        &self,
        record: &AppRecord,
        resource: &str,
        item: Option<&str>,
    ) -> Result<Value, ResourceError> {
        validate_name(resource)?;
        let base = Self::base(record)?;
        let url = match item {
            Some(item) => {
                validate_name(item)?;
                format!("{base}/api/{resource}/{item}")
            }
            None => format!("{base}/api/{resource}"),
        };
        self.get_json(&url).await
    }

    async fn get_json(&self, url: &str) -> Result<Value, ResourceError> {
        debug!(target: "homehelper::resources", %url, "resource passthrough");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ResourceError::Unreachable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResourceError::Upstream(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ResourceError::Unreachable(err.to_string()))?;
        serde_json::from_slice(&body).map_err(|err| ResourceError::Malformed(err.to_string()))
    }
}

fn validate_name(name: &str) -> Result<(), ResourceError> {
    if RESOURCE_NAME_RE.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(ResourceError::InvalidName(name.to_string()))
    }
}
