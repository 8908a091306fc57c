use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use hh_core::config::BrokerConfig;
use hh_events::{Envelope, Event, Origin};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::EventRouter;
use crate::tasks::TaskHandle;

const RECONNECT_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker url `{url}` is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("broker unreachable: {0}")]
    Connect(String),
    #[error("broker publish failed: {0}")]
    Publish(String),
}

/// Pub/sub transport shared with the hosted apps.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Subscribes to every topic matching `pattern`. The stream ends when the connection drops.
    async fn subscribe(&self, pattern: &str)
        -> Result<BoxStream<'static, BrokerMessage>, BrokerError>;
}

/// Redis pub/sub client. Publishing reuses one multiplexed connection, re-established lazily
/// after a failure; every subscription gets its own connection.
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Parses the URL without connecting.
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|err| BrokerError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let sent: redis::RedisResult<()> = conn.publish(topic, payload).await;
        if let Err(err) = sent {
            self.publisher.lock().await.take();
            return Err(BrokerError::Publish(err.to_string()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, BrokerMessage>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        let stream = pubsub.into_on_message().map(|msg| BrokerMessage {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(stream.boxed())
    }
}

/// Body of an event read from the broker. App-side clients spell the source `source_app` and
/// send extra fields (severity, message, integer timestamps) that the core does not keep.
#[derive(Debug, Deserialize)]
struct InboundEvent {
    #[serde(alias = "source_app")]
    source: String,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    relayed_by: Option<String>,
}

/// Mirrors local events onto the broker and feeds app events from the broker into the router.
///
/// Outbound payloads carry `relayed_by: <core source>` so the subscriber can drop its own
/// echoes; events that came in from the broker are never published back.
pub struct BrokerBridge {
    broker: Arc<dyn Broker>,
    router: EventRouter,
    reconnect_max: Duration,
    reachable: AtomicBool,
}

impl BrokerBridge {
    pub fn new(broker: Arc<dyn Broker>, router: EventRouter, config: &BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            router,
            reconnect_max: Duration::from_secs(config.reconnect_max_secs).max(RECONNECT_BASE),
            reachable: AtomicBool::new(true),
        })
    }

    /// Starts the publisher and subscriber loops. The bus subscription is taken before this
    /// returns, so events emitted afterwards are forwarded.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<TaskHandle> {
        let rx = self.router.subscribe();
        let publisher = tokio::spawn(self.clone().run_publisher(rx, cancel.clone()));
        let subscriber = tokio::spawn(self.clone().run_subscriber(cancel));
        vec![
            TaskHandle::new("broker.publisher", publisher),
            TaskHandle::new("broker.subscriber", subscriber),
        ]
    }

    async fn run_publisher(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        loop {
            // Drain queued events before honouring cancellation so shutdown events still go out.
            let envelope = tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "homehelper::events", skipped, "broker publisher lagged; events not forwarded");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            };
            if envelope.origin == Origin::Broker {
                continue;
            }
            self.forward(&envelope).await;
        }
        debug!(target: "homehelper::events", "broker publisher stopped");
    }

    async fn forward(&self, envelope: &Envelope) {
        let mut body = match serde_json::to_value(&envelope.event) {
            Ok(body) => body,
            Err(err) => {
                warn!(target: "homehelper::events", topic = %envelope.topic, error = %err, "event not serializable");
                return;
            }
        };
        if let Value::Object(map) = &mut body {
            map.insert(
                "relayed_by".into(),
                Value::String(self.router.source().to_string()),
            );
        }
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "homehelper::events", topic = %envelope.topic, error = %err, "event not serializable");
                return;
            }
        };
        match self.broker.publish(&envelope.topic, payload).await {
            Ok(()) => {
                if !self.reachable.swap(true, Ordering::Relaxed) {
                    info!(target: "homehelper::events", "broker reachable again");
                }
            }
            Err(err) => {
                if self.reachable.swap(false, Ordering::Relaxed) {
                    warn!(target: "homehelper::events", error = %err, "broker publish failed; events stay local");
                } else {
                    debug!(target: "homehelper::events", topic = %envelope.topic, error = %err, "broker publish failed");
                }
            }
        }
    }

    async fn run_subscriber(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = RECONNECT_BASE;
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribed = self.broker.subscribe(hh_topics::TOPIC_PATTERN) => subscribed,
            };
            match subscribed {
                Ok(mut stream) => {
                    info!(target: "homehelper::events", pattern = hh_topics::TOPIC_PATTERN, "subscribed to broker events");
                    delay = RECONNECT_BASE;
                    loop {
                        let message = tokio::select! {
                            _ = cancel.cancelled() => return,
                            message = stream.next() => message,
                        };
                        match message {
                            Some(message) => {
                                self.accept(&message);
                            }
                            None => break,
                        }
                    }
                    warn!(target: "homehelper::events", "broker subscription closed");
                }
                Err(err) => warn!(
                    target: "homehelper::events",
                    error = %err,
                    retry_ms = delay.as_millis() as u64,
                    "broker subscription failed"
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.reconnect_max);
        }
        debug!(target: "homehelper::events", "broker subscriber stopped");
    }

    /// Relays one broker message. The type comes from the body, else from the topic.
    fn accept(&self, message: &BrokerMessage) -> Option<Event> {
        let inbound = match serde_json::from_slice::<InboundEvent>(&message.payload) {
            Ok(inbound) => inbound,
            Err(err) => {
                debug!(target: "homehelper::events", topic = %message.topic, error = %err, "malformed broker message ignored");
                return None;
            }
        };
        if inbound.relayed_by.as_deref() == Some(self.router.source()) {
            return None;
        }
        let event_type = inbound
            .event_type
            .as_deref()
            .or_else(|| hh_topics::event_type_of(&message.topic))?;
        match self.router.ingest(&inbound.source, event_type, inbound.data) {
            Ok(event) => Some(event),
            Err(err) => {
                debug!(target: "homehelper::events", topic = %message.topic, error = %err, "broker event rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBroker;
    use hh_events::Bus;
    use serde_json::json;

    fn bridge_with(broker: Arc<FakeBroker>) -> (EventRouter, Arc<BrokerBridge>) {
        let router = EventRouter::new(Bus::new(64), "homehelper", 50);
        let bridge = BrokerBridge::new(broker, router.clone(), &BrokerConfig::default());
        (router, bridge)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition never held");
    }

    fn payload(message: &BrokerMessage) -> Value {
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test]
    async fn local_events_are_published_with_relay_marker() {
        let broker = FakeBroker::new();
        let (router, bridge) = bridge_with(broker.clone());
        let cancel = CancellationToken::new();
        let _tasks = bridge.spawn(cancel.clone());

        router.emit(hh_topics::EVENT_APP_STARTED, json!({"app_id": "notes"}));
        router.relay("weather", "rain_started", json!({"mm": 3})).unwrap();
        eventually(|| broker.published().len() == 2).await;

        let published = broker.published();
        assert_eq!(published[0].topic, "events.app_started");
        let body = payload(&published[0]);
        assert_eq!(body["source"], "homehelper");
        assert_eq!(body["relayed_by"], "homehelper");
        assert_eq!(body["data"]["app_id"], "notes");
        assert_eq!(published[1].topic, "events.rain_started");
        assert_eq!(payload(&published[1])["source"], "weather");
        cancel.cancel();
    }

    #[tokio::test]
    async fn app_events_from_broker_reach_local_subscribers_once() {
        let broker = FakeBroker::new();
        let (router, bridge) = bridge_with(broker.clone());
        let cancel = CancellationToken::new();
        let _tasks = bridge.spawn(cancel.clone());
        eventually(|| broker.subscriber_count() == 1).await;
        let mut rx = router.subscribe();

        broker.deliver(
            "events.door_opened",
            &json!({
                "timestamp": 1_700_000_000,
                "source_app": "frontdoor",
                "event_type": "door_opened",
                "severity": "info",
                "message": "door opened",
                "data": {"door": "front"}
            }),
        );
        let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.origin, Origin::Broker);
        assert_eq!(env.event.source, "frontdoor");
        assert_eq!(env.event.data["door"], "front");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.published().is_empty());
        assert_eq!(router.recent(10, Some("door_opened")).len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn own_echoes_are_not_relayed_again() {
        let broker = FakeBroker::new();
        let (router, bridge) = bridge_with(broker.clone());
        let cancel = CancellationToken::new();
        let _tasks = bridge.spawn(cancel.clone());
        eventually(|| broker.subscriber_count() == 1).await;

        router.emit(hh_topics::EVENT_APP_STOPPED, json!({"app_id": "notes"}));
        eventually(|| broker.delivered() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.recent(10, Some("app_stopped")).len(), 1);
        assert_eq!(broker.published().len(), 1);
        cancel.cancel();
    }

    #[test]
    fn type_falls_back_to_topic_and_garbage_is_dropped() {
        let (router, bridge) = bridge_with(FakeBroker::new());
        let event = bridge
            .accept(&BrokerMessage {
                topic: "events.motion_detected".into(),
                payload: br#"{"source": "hallway", "data": {"zone": 2}}"#.to_vec(),
            })
            .unwrap();
        assert_eq!(event.event_type, "motion_detected");
        assert_eq!(event.source, "hallway");

        assert!(bridge
            .accept(&BrokerMessage {
                topic: "events.motion_detected".into(),
                payload: b"not json".to_vec(),
            })
            .is_none());
        assert!(bridge
            .accept(&BrokerMessage {
                topic: "metrics.cpu".into(),
                payload: br#"{"source": "hallway"}"#.to_vec(),
            })
            .is_none());
        assert!(bridge
            .accept(&BrokerMessage {
                topic: "events.Bad".into(),
                payload: br#"{"source": "hallway", "event_type": "Bad Type"}"#.to_vec(),
            })
            .is_none());
        assert_eq!(router.recent_len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_keeps_events_local() {
        let broker = FakeBroker::new();
        broker.fail_publishes(true);
        let (router, bridge) = bridge_with(broker.clone());
        let cancel = CancellationToken::new();
        let _tasks = bridge.spawn(cancel.clone());

        router.emit(hh_topics::EVENT_APP_CRASHED, json!({"app_id": "notes"}));
        eventually(|| !bridge.reachable.load(Ordering::Relaxed)).await;
        assert_eq!(router.recent_len(), 1);

        broker.fail_publishes(false);
        router.emit(hh_topics::EVENT_APP_STARTED, json!({"app_id": "notes"}));
        eventually(|| broker.published().len() == 1).await;
        eventually(|| bridge.reachable.load(Ordering::Relaxed)).await;
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_is_re_established() {
        let broker = FakeBroker::new();
        let (router, bridge) = bridge_with(broker.clone());
        let cancel = CancellationToken::new();
        let _tasks = bridge.spawn(cancel.clone());
        eventually(|| broker.subscriber_count() == 1).await;

        broker.disconnect_subscribers();
        eventually(|| broker.subscribe_calls() == 2 && broker.subscriber_count() == 1).await;
        broker.deliver(
            "events.rain_started",
            &json!({"source": "weather", "event_type": "rain_started"}),
        );
        eventually(|| router.recent_len() == 1).await;
        cancel.cancel();
    }
}
