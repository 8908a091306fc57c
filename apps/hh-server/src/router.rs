use std::sync::Arc;

use hh_events::{Bus, Envelope, Event, Origin, RecentEvents};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

static EVENT_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("event type pattern"));

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("event type `{0}` must match [a-z][a-z0-9_]*")]
    InvalidType(String),
    #[error("event source must not be empty")]
    MissingSource,
}

/// Publishes core events and relays app-originated ones onto the bus. Publishing never
/// blocks the caller; the recent-event list is kept for dashboards, not replayed to subscribers.
#[derive(Clone)]
pub struct EventRouter {
    bus: Bus,
    source: String,
    recent: Arc<RecentEvents>,
}

impl EventRouter {
    pub fn new(bus: Bus, source: impl Into<String>, recent_capacity: usize) -> Self {
        Self {
            bus,
            source: source.into(),
            recent: Arc::new(RecentEvents::new(recent_capacity)),
        }
    }

    /// Emits an event originating from the core itself.
    pub fn emit(&self, event_type: &str, data: Value) {
        self.publish(Event::new(self.source.clone(), event_type, data), Origin::Local);
    }

    /// Relays an event sent by an app.
    pub fn relay(&self, source: &str, event_type: &str, data: Value) -> Result<Event, RelayError> {
        let event = validated(source, event_type, data)?;
        self.publish(event.clone(), Origin::Local);
        Ok(event)
    }

    /// Publishes an event received from the external broker. Subscribers see it like any
    /// relayed event, but it is not forwarded back to the broker.
    pub fn ingest(&self, source: &str, event_type: &str, data: Value) -> Result<Event, RelayError> {
        let event = validated(source, event_type, data)?;
        self.publish(event.clone(), Origin::Broker);
        Ok(event)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn publish(&self, event: Event, origin: Origin) {
        debug!(
            target: "homehelper::events",
            source = %event.source,
            event_type = %event.event_type,
            ?origin,
            "event published"
        );
        self.recent.push(event.clone());
        self.bus.publish_from(event, origin);
    }

    pub fn recent(&self, limit: usize, event_type: Option<&str>) -> Vec<Event> {
        self.recent.latest(limit, event_type)
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe()
    }
}

fn validated(source: &str, event_type: &str, data: Value) -> Result<Event, RelayError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(RelayError::MissingSource);
    }
    if !EVENT_TYPE_RE.is_match(event_type) {
        return Err(RelayError::InvalidType(event_type.to_string()));
    }
    Ok(Event::new(source, event_type, data))
}
