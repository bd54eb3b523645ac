//! WebSocket connection manager.
//!
//! Tracks live connections per (collection, owner) topic so that accepted
//! pushes notify exactly the clients replicating that owner's documents.

use std::sync::Arc;

use chartsync_engine::LiveMessage;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<LiveMessage>;

/// Notification topic: collection and owner.
pub type Topic = (String, String);

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub topic: Topic,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    /// Connection ids per topic
    by_topic: DashMap<Topic, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a connection and return its id.
    pub fn register(&self, collection: &str, owner_id: &str, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let topic = (collection.to_string(), owner_id.to_string());

        self.by_topic
            .entry(topic.clone())
            .or_default()
            .push(conn_id.clone());
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                topic,
                sender,
            },
        );

        tracing::info!(conn_id = %conn_id, %collection, owner = %owner_id, "live connection registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return;
        };
        if let Some(mut ids) = self.by_topic.get_mut(&conn.topic) {
            ids.retain(|id| id != conn_id);
            if ids.is_empty() {
                drop(ids);
                self.by_topic.remove_if(&conn.topic, |_, ids| ids.is_empty());
            }
        }
        tracing::info!(conn_id = %conn_id, "live connection unregistered");
    }

    /// Send `message` to every connection on a topic.
    ///
    /// Returns the number of connections that received it.
    pub fn notify(&self, collection: &str, owner_id: &str, message: LiveMessage) -> usize {
        let topic = (collection.to_string(), owner_id.to_string());
        let ids = match self.by_topic.get(&topic) {
            Some(ids) => ids.value().clone(),
            None => return 0,
        };

        let sent = ids
            .iter()
            .filter(|id| self.send_to(id, message.clone()))
            .count();
        tracing::debug!(%collection, owner = %owner_id, recipients = sent, "live notification");
        sent
    }

    /// Send a message to one connection.
    pub fn send_to(&self, conn_id: &str, message: LiveMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.by_topic.len()
    }
}
