use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event body carried on every `events.<event_type>` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn topic(&self) -> String {
        hh_topics::topic_for(&self.event_type)
    }
}

/// Where an event entered the bus.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Emitted by the core or relayed through its own API.
    #[default]
    Local,
    /// Received from the external broker; never forwarded back to it.
    Broker,
}

/// An event paired with the topic it was published on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: Event,
    #[serde(default)]
    pub origin: Origin,
}

/// Broadcast bus for events. Delivery is at-most-once: nothing is buffered for
/// subscribers that attach after a publish.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes an event on its `events.<event_type>` topic. Never blocks and never fails;
    /// an event with no subscribers is dropped.
    pub fn publish(&self, event: Event) {
        self.publish_from(event, Origin::Local);
    }

    pub fn publish_from(&self, event: Event, origin: Origin) {
        let topic = event.topic();
        if self.tx.send(Envelope { topic, event, origin }).is_err() {
            tracing::trace!(target: "homehelper::events", "event dropped: no subscribers");
        }
    }
}

/// Bounded in-memory list of the most recent events, newest last.
pub struct RecentEvents {
    capacity: usize,
    items: Mutex<VecDeque<Event>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, event: Event) {
        let mut guard = self.items.lock();
        while guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    /// Returns up to `limit` events, newest first, optionally filtered by type.
    pub fn latest(&self, limit: usize, event_type: Option<&str>) -> Vec<Event> {
        let guard = self.items.lock();
        guard
            .iter()
            .rev()
            .filter(|event| event_type.map_or(true, |kind| event.event_type == kind))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
