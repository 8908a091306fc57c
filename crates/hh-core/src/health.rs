use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on the length of a health message, in characters.
pub const HEALTH_MESSAGE_MAX: usize = 100;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Good,
    Warning,
    Error,
    #[default]
    Unknown,
}

impl HealthGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthGrade::Good => "good",
            HealthGrade::Warning => "warning",
            HealthGrade::Error => "error",
            HealthGrade::Unknown => "unknown",
        }
    }

    /// Parses an app-reported grade. Apps may only report good, warning or error.
    pub fn from_reported(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "good" | "ok" | "healthy" => Some(HealthGrade::Good),
            "warning" | "warn" | "degraded" => Some(HealthGrade::Warning),
            "error" | "bad" | "unhealthy" => Some(HealthGrade::Error),
            _ => None,
        }
    }

    /// Counts toward the consecutive-failure crash threshold.
    pub fn is_failure(&self) -> bool {
        matches!(self, HealthGrade::Error)
    }
}

/// One health observation for an app.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub grade: HealthGrade,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(grade: HealthGrade, message: impl Into<String>) -> Self {
        Self {
            grade,
            message: truncate_message(message.into()),
            extra: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(HealthGrade::Unknown, message)
    }

    pub fn with_extra(mut self, extra: Option<Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Classifies the outcome of a probe. Transport failures and malformed replies are `error`.
    pub fn from_probe(outcome: Result<HealthReport, ProbeError>) -> Self {
        match outcome {
            Ok(report) => match HealthGrade::from_reported(&report.health) {
                Some(grade) => Self::new(grade, report.message).with_extra(report.extra_info),
                None => Self::new(
                    HealthGrade::Error,
                    format!("unrecognised health value `{}`", report.health),
                ),
            },
            Err(err) => Self::new(HealthGrade::Error, err.to_string()),
        }
    }
}

fn truncate_message(message: String) -> String {
    if message.chars().count() <= HEALTH_MESSAGE_MAX {
        return message;
    }
    message.chars().take(HEALTH_MESSAGE_MAX).collect()
}

/// Most recent health observations for one app, newest last.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthHistory {
    entries: VecDeque<HealthStatus>,
}

impl HealthHistory {
    pub fn push(&mut self, status: HealthStatus, capacity: usize) {
        let capacity = capacity.max(1);
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(status);
    }

    pub fn latest(&self) -> Option<&HealthStatus> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthStatus> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current health as seen at `now`: the latest observation, or `unknown` when there is none
    /// or the latest one is older than `staleness`.
    pub fn current(&self, now: DateTime<Utc>, staleness: std::time::Duration) -> HealthStatus {
        let Some(latest) = self.latest() else {
            return HealthStatus::unknown("no health data yet").at(now);
        };
        let limit = ChronoDuration::from_std(staleness).unwrap_or(ChronoDuration::MAX);
        if now.signed_duration_since(latest.timestamp) > limit {
            return HealthStatus::unknown(format!(
                "last observation at {} is stale",
                latest.timestamp.to_rfc3339()
            ))
            .at(now);
        }
        latest.clone()
    }
}

/// Body returned by an app's health endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub health: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub extra_info: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct ProbeTarget {
    pub app_id: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("health probe timed out")]
    Timeout,
    #[error("health endpoint unreachable: {0}")]
    Connect(String),
    #[error("health endpoint returned HTTP {0}")]
    Status(u16),
    #[error("malformed health response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<HealthReport, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn probe_timeout_is_an_error_grade() {
        let status = HealthStatus::from_probe(Err(ProbeError::Timeout));
        assert_eq!(status.grade, HealthGrade::Error);
        assert!(status.grade.is_failure());
        let explicit = HealthStatus::from_probe(Ok(HealthReport {
            health: "error".into(),
            message: "disk full".into(),
            extra_info: None,
        }));
        assert_eq!(explicit.grade, status.grade);
    }

    #[test]
    fn warning_is_not_a_failure() {
        let status = HealthStatus::from_probe(Ok(HealthReport {
            health: "warning".into(),
            message: "slow".into(),
            extra_info: Some(json!({"latency_ms": 900})),
        }));
        assert_eq!(status.grade, HealthGrade::Warning);
        assert!(!status.grade.is_failure());
        assert_eq!(status.extra, Some(json!({"latency_ms": 900})));
    }

    #[test]
    fn unrecognised_health_value_is_error() {
        let status = HealthStatus::from_probe(Ok(HealthReport {
            health: "fantastic".into(),
            message: String::new(),
            extra_info: None,
        }));
        assert_eq!(status.grade, HealthGrade::Error);
    }

    #[test]
    fn messages_are_bounded() {
        let status = HealthStatus::new(HealthGrade::Good, "x".repeat(250));
        assert_eq!(status.message.chars().count(), HEALTH_MESSAGE_MAX);
    }

    #[test]
    fn history_is_bounded_and_goes_stale() {
        let mut history = HealthHistory::default();
        let now = Utc::now();
        assert_eq!(
            history.current(now, Duration::from_secs(60)).grade,
            HealthGrade::Unknown
        );
        for _ in 0..5 {
            history.push(HealthStatus::new(HealthGrade::Good, "ok").at(now), 3);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.current(now, Duration::from_secs(60)).grade,
            HealthGrade::Good
        );
        let later = now + ChronoDuration::seconds(120);
        assert_eq!(
            history.current(later, Duration::from_secs(60)).grade,
            HealthGrade::Unknown
        );
    }
}
