//! In-process pub-sub for live gateway events. Events are routed by topic
//! (`user:<uuid>`, `session:<sid>`, `broadcast:<id>`); each subscriber owns
//! a bounded mpsc receiver. Delivery is best-effort: a full or closed
//! subscriber never blocks a publisher, and closed subscribers are swept
//! on publish.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Well-known event names.
pub mod events {
    pub const SESSION_QR: &str = "session:qr";
    pub const SESSION_CONNECTED: &str = "session:connected";
    pub const SESSION_DISCONNECTED: &str = "session:disconnected";
    pub const SESSION_CONNECTION_FAILED: &str = "session:connection_failed";
    pub const SESSION_STATUS: &str = "session:status";
    pub const MESSAGE_INCOMING: &str = "message:incoming";
    pub const MESSAGE_SENT: &str = "message:sent";
    pub const MESSAGE_STATUS: &str = "message:status";
    pub const BROADCAST_STARTED: &str = "broadcast:started";
    pub const BROADCAST_PROGRESS: &str = "broadcast:progress";
    pub const BROADCAST_COMPLETED: &str = "broadcast:completed";
    pub const BROADCAST_FAILED: &str = "broadcast:failed";
}

/// Routing-key constructors.
pub mod topics {
    use uuid::Uuid;

    pub fn user(user_id: &Uuid) -> String {
        format!("user:{}", user_id)
    }

    pub fn session(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub fn broadcast(campaign_id: i64) -> String {
        format!("broadcast:{}", campaign_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event: String,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl GatewayEvent {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            at: Utc::now(),
        }
    }
}

const DEFAULT_BUFFER_SIZE: usize = 256;

/// Per-topic subscriber sets behind one mutex (spec'd single owner); the
/// shutdown watch mirrors the shape the rest of the process selects on.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<GatewayEvent>>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Register a new subscriber under `topic`.
    pub async fn subscribe(&self, topic: &str, buffer: Option<usize>) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(buffer.unwrap_or(DEFAULT_BUFFER_SIZE));
        let mut subs = self.subscribers.lock().await;
        subs.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Publish `event` under every routing key in `topics`. Dead channels
    /// are swept; a full buffer drops the event for that subscriber only.
    pub async fn publish(&self, topic_keys: &[String], event: GatewayEvent) {
        let mut subs = self.subscribers.lock().await;
        for topic in topic_keys {
            let Some(senders) = subs.get_mut(topic) else {
                continue;
            };
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("event bus: subscriber on '{}' is full, dropping event", topic);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                subs.remove(topic);
            }
        }
    }

    /// Number of live subscribers under a topic (diagnostics).
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .await
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_events_on_their_topic() {
        let bus = EventBus::new();
        let mut user_rx = bus.subscribe("user:u1", Some(8)).await;
        let mut session_rx = bus.subscribe("session:s1", Some(8)).await;
        let mut other_rx = bus.subscribe("session:s2", Some(8)).await;

        bus.publish(
            &["user:u1".into(), "session:s1".into()],
            GatewayEvent::new(events::MESSAGE_INCOMING, json!({"messageId": "m-1"})),
        )
        .await;

        let evt = user_rx.recv().await.expect("user subscriber should get event");
        assert_eq!(evt.event, events::MESSAGE_INCOMING);
        let evt = session_rx.recv().await.expect("session subscriber should get event");
        assert_eq!(evt.data["messageId"], "m-1");

        assert!(other_rx.try_recv().is_err(), "unrelated topic must not receive");
    }

    #[tokio::test]
    async fn dead_subscribers_are_swept_on_publish() {
        let bus = EventBus::new();
        let rx = bus.subscribe("session:s1", Some(1)).await;
        drop(rx);

        bus.publish(
            &["session:s1".into()],
            GatewayEvent::new(events::SESSION_STATUS, json!({"status": "connected"})),
        )
        .await;

        assert_eq!(bus.subscriber_count("session:s1").await, 0);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("session:s1", Some(1)).await;

        for i in 0..5 {
            bus.publish(
                &["session:s1".into()],
                GatewayEvent::new(events::SESSION_STATUS, json!({"seq": i})),
            )
            .await;
        }

        // First event is buffered, the rest were dropped; subscriber lives.
        let evt = rx.recv().await.expect("first event should be buffered");
        assert_eq!(evt.data["seq"], 0);
        assert_eq!(bus.subscriber_count("session:s1").await, 1);
    }

    #[tokio::test]
    async fn shutdown_flag_propagates() {
        let bus = EventBus::new();
        let mut signal = bus.shutdown_signal();
        assert!(!bus.is_shutdown());
        bus.shutdown();
        signal.changed().await.expect("watch should update");
        assert!(*signal.borrow());
    }
}
