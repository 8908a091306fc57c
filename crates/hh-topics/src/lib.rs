//! Canonical event type names shared by the orchestration core and the apps it hosts.
//!
//! Every event travels on the topic `events.<event_type>`; use [`topic_for`] rather than
//! formatting topic strings by hand. Keep this list alphabetized within sections.

/// Prefix shared by every event topic.
pub const TOPIC_PREFIX: &str = "events";

/// Broker subscription pattern matching every event topic.
pub const TOPIC_PATTERN: &str = "events.*";

// Service lifecycle
pub const EVENT_APP_CRASHED: &str = "app_crashed";
pub const EVENT_APP_FAILED: &str = "app_failed";
pub const EVENT_APP_RESTARTING: &str = "app_restarting";
pub const EVENT_APP_STARTED: &str = "app_started";
pub const EVENT_APP_STOPPED: &str = "app_stopped";

// Registry / discovery
pub const EVENT_APP_MANIFEST_CHANGED: &str = "app_manifest_changed";
pub const EVENT_APP_REGISTERED: &str = "app_registered";
pub const EVENT_APP_UNINSTALLED: &str = "app_uninstalled";
pub const EVENT_DISCOVERY_COMPLETED: &str = "discovery_completed";
pub const EVENT_PORT_MISMATCH: &str = "port_mismatch";

// Health
pub const EVENT_APP_HEALTH_CHANGED: &str = "app_health_changed";

// System
pub const EVENT_REGISTRY_REBUILT: &str = "registry_rebuilt";
pub const EVENT_SYSTEM_STARTED: &str = "system_started";
pub const EVENT_SYSTEM_STOPPING: &str = "system_stopping";

// Interactive apps
pub const EVENT_UI_CLOSED: &str = "ui_closed";
pub const EVENT_UI_EXPIRED: &str = "ui_expired";
pub const EVENT_UI_OPENED: &str = "ui_opened";

/// Topic name for an event type (`events.<event_type>`).
pub fn topic_for(event_type: &str) -> String {
    format!("{TOPIC_PREFIX}.{event_type}")
}

/// Returns the event type carried by a topic, if the topic follows the `events.` convention.
pub fn event_type_of(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_events_prefix() {
        assert_eq!(topic_for(EVENT_APP_STARTED), "events.app_started");
        assert_eq!(event_type_of("events.ui_opened"), Some("ui_opened"));
        assert_eq!(event_type_of("events."), None);
        assert_eq!(event_type_of("metrics.app_started"), None);
    }
}
