//! Connection registry for realtime subscribers.
//!
//! The registry owns the logical state of every live connection: its
//! metadata, its topic subscriptions and the sending half of its outbox.
//! Socket I/O belongs to the transport, which claims each connection's
//! receiving half with [`ConnectionRegistry::take_outbox`].

use crate::application::metrics::Metrics;
use crate::application::ports::Storage;
use crate::infrastructure::storage::ShardedStorage;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Opaque per-connection metadata supplied by the transport.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Receiving half of a connection's outbox.
pub type Outbox = mpsc::UnboundedReceiver<String>;

#[derive(Debug)]
struct Connection {
    metadata: Metadata,
    subscriptions: BTreeSet<String>,
    sender: mpsc::UnboundedSender<String>,
    outbox: Option<Outbox>,
}

impl Connection {
    fn new() -> Self {
        let (sender, outbox) = mpsc::unbounded_channel();
        Self {
            metadata: Metadata::new(),
            subscriptions: BTreeSet::new(),
            sender,
            outbox: Some(outbox),
        }
    }

    fn deliver(&self, message: String) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Liveness report served by the health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Always `"healthy"` while the registry is reachable
    pub status: &'static str,
    /// Number of live connections
    pub connections: usize,
}

/// Tracks live connections and hands messages to them.
///
/// Operations on one connection id are serialized; distinct ids do not
/// interfere. Clones share the same connections.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<ShardedStorage<String, Connection>>,
    metrics: Metrics,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_metrics(Metrics::new())
    }

    /// Create an empty registry reporting into shared metrics.
    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            connections: Arc::new(ShardedStorage::new()),
            metrics,
        }
    }

    /// Register `id`, or replace the metadata of an existing connection.
    ///
    /// Re-connecting keeps the existing outbox and subscriptions. Always
    /// returns `true`.
    pub fn connect(&self, id: impl Into<String>, metadata: Option<Metadata>) -> bool {
        let id = id.into();
        let mut created = false;

        self.connections.with_entry_mut(
            id.clone(),
            || {
                created = true;
                Connection::new()
            },
            |connection| connection.metadata = metadata.unwrap_or_default(),
        );

        if created {
            self.metrics.record_connection();
            info!(connection_id = %id, "connection registered");
        } else {
            debug!(connection_id = %id, "connection metadata replaced");
        }
        true
    }

    /// Remove `id`. Returns `true` if it was connected.
    ///
    /// Dropping the connection closes its outbox, so the transport's receiver
    /// observes end of stream.
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self.connections.remove(&id.to_string()).is_some();
        if removed {
            info!(connection_id = %id, "connection removed");
        }
        removed
    }

    /// Hand `message` to a connected id. Returns `false` if `id` is absent.
    ///
    /// A `true` result certifies that the target was live and the message
    /// was accepted for delivery; it does not wait for the transport.
    pub fn publish(&self, id: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let delivered = self
            .connections
            .with_existing(&id.to_string(), |connection| {
                if !connection.deliver(message) {
                    debug!(connection_id = %id, "outbox closed by transport");
                }
            })
            .is_some();

        if delivered {
            self.metrics.record_published(1);
        } else {
            self.metrics.record_publish_miss();
            debug!(connection_id = %id, "publish target not connected");
        }
        delivered
    }

    /// Claim the receiving half of a connection's outbox.
    ///
    /// Returns `None` if `id` is absent or the outbox was already claimed.
    pub fn take_outbox(&self, id: &str) -> Option<Outbox> {
        self.connections
            .with_existing(&id.to_string(), |connection| connection.outbox.take())
            .flatten()
    }

    /// Subscribe a connection to `topic`. Returns `false` if `id` is absent.
    pub fn subscribe(&self, id: &str, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        self.connections
            .with_existing(&id.to_string(), |connection| {
                connection.subscriptions.insert(topic);
            })
            .is_some()
    }

    /// Unsubscribe a connection from `topic`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: &str, topic: &str) -> bool {
        self.connections
            .with_existing(&id.to_string(), |connection| {
                connection.subscriptions.remove(topic)
            })
            .unwrap_or(false)
    }

    /// Send `message` to every connection subscribed to `topic`.
    ///
    /// Returns the number of connections the message was handed to.
    pub fn broadcast(&self, topic: &str, message: &str) -> usize {
        let mut delivered = 0;
        self.connections.for_each(|_, connection| {
            if connection.subscriptions.contains(topic) {
                connection.deliver(message.to_string());
                delivered += 1;
            }
        });

        self.metrics.record_published(delivered as u64);
        debug!(topic, delivered, "broadcast");
        delivered
    }

    /// Metadata of a connected id.
    pub fn metadata(&self, id: &str) -> Option<Metadata> {
        self.connections
            .with_existing(&id.to_string(), |connection| connection.metadata.clone())
    }

    /// Topics a connected id is subscribed to.
    pub fn subscriptions(&self, id: &str) -> Option<Vec<String>> {
        self.connections.with_existing(&id.to_string(), |connection| {
            connection.subscriptions.iter().cloned().collect()
        })
    }

    /// Check if `id` is connected.
    pub fn is_connected(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.keys()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Liveness report.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            connections: self.connections.len(),
        }
    }

    /// Drop every connection. Returns how many were dropped.
    pub fn disconnect_all(&self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(count, "all connections removed");
        }
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_follows_connection_lifecycle() {
        let registry = ConnectionRegistry::new();

        assert!(registry.connect("c1", None));
        assert!(registry.publish("c1", "hi"));
        assert!(!registry.publish("unknown", "hi"));

        assert!(registry.disconnect("c1"));
        assert!(!registry.publish("c1", "hi"));
        assert!(!registry.disconnect("c1"));
    }

    #[test]
    fn test_reconnect_overwrites_metadata() {
        let registry = ConnectionRegistry::new();
        let first = Metadata::from([("user".to_string(), json!("alice"))]);
        let second = Metadata::from([("user".to_string(), json!("bob"))]);

        assert!(registry.connect("c1", Some(first)));
        assert!(registry.connect("c1", Some(second.clone())));

        assert_eq!(registry.metadata("c1"), Some(second));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.metrics.snapshot().connections_total, 1);
    }

    #[tokio::test]
    async fn test_outbox_receives_published_messages() {
        let registry = ConnectionRegistry::new();
        registry.connect("c1", None);
        let mut outbox = registry.take_outbox("c1").unwrap();
        assert!(registry.take_outbox("c1").is_none());

        registry.publish("c1", "one");
        registry.publish("c1", "two");
        assert_eq!(outbox.recv().await.as_deref(), Some("one"));
        assert_eq!(outbox.recv().await.as_deref(), Some("two"));

        registry.disconnect("c1");
        assert_eq!(outbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_outbox_and_subscriptions() {
        let registry = ConnectionRegistry::new();
        registry.connect("c1", None);
        registry.subscribe("c1", "predictions");
        let mut outbox = registry.take_outbox("c1").unwrap();

        registry.connect("c1", None);
        registry.publish("c1", "still here");

        assert_eq!(outbox.recv().await.as_deref(), Some("still here"));
        assert_eq!(registry.subscriptions("c1"), Some(vec!["predictions".to_string()]));
    }

    #[test]
    fn test_broadcast_reaches_subscribers_only() {
        let registry = ConnectionRegistry::new();
        for id in ["a", "b", "c"] {
            registry.connect(id, None);
        }
        registry.subscribe("a", "alerts");
        registry.subscribe("b", "alerts");
        registry.subscribe("c", "other");

        assert_eq!(registry.broadcast("alerts", "fire"), 2);
        assert!(registry.unsubscribe("b", "alerts"));
        assert!(!registry.unsubscribe("b", "alerts"));
        assert_eq!(registry.broadcast("alerts", "fire"), 1);
        assert!(!registry.subscribe("missing", "alerts"));
    }

    #[test]
    fn test_subscriptions_vanish_on_disconnect() {
        let registry = ConnectionRegistry::new();
        registry.connect("a", None);
        registry.subscribe("a", "alerts");
        registry.disconnect("a");
        registry.connect("a", None);

        assert_eq!(registry.broadcast("alerts", "fire"), 0);
    }

    #[test]
    fn test_health_serializes_to_json() {
        let registry = ConnectionRegistry::new();
        registry.connect("a", None);
        registry.connect("b", None);

        let report = serde_json::to_value(registry.health()).unwrap();
        assert_eq!(report, json!({"status": "healthy", "connections": 2}));
    }

    #[test]
    fn test_publish_metrics() {
        let registry = ConnectionRegistry::new();
        registry.connect("a", None);
        registry.publish("a", "x");
        registry.publish("missing", "x");

        let snapshot = registry.metrics.snapshot();
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.publish_misses, 1);
    }

    #[test]
    fn test_concurrent_connects_on_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", worker, i);
                        registry.connect(id.clone(), None);
                        assert!(registry.publish(&id, "ping"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.connection_count(), 400);
        assert_eq!(registry.disconnect_all(), 400);
        assert!(registry.connection_ids().is_empty());
    }
}
