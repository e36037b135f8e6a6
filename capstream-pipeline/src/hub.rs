use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use capstream_core::metrics::{BROADCAST_TOTAL, SUBSCRIBERS};
use capstream_core::Result;

use crate::sink::{BroadcastReport, BroadcastSink};

/// Handle for a subscriber connection
pub type ConnectionId = String;

#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: ConnectionId,
    sender: mpsc::Sender<Bytes>,
}

/// In-memory registry of live subscribers per destination
///
/// Each subscriber gets a bounded buffer. Broadcasting copies the
/// destination's subscriber list out of the map first, so connects and
/// disconnects never contend with an in-progress fan-out.
#[derive(Clone)]
pub struct SubscriberRegistry {
    /// destination -> subscribers
    destinations: Arc<DashMap<String, Vec<Subscriber>>>,

    /// connection_id -> destination, for cleanup
    connections: Arc<DashMap<ConnectionId, String>>,

    buffer: usize,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            destinations: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Attach a connection to a destination. A connection id already in
    /// use is detached from its previous destination first.
    pub fn subscribe(&self, destination: &str, connection_id: ConnectionId) -> mpsc::Receiver<Bytes> {
        if self.connections.contains_key(&connection_id) {
            self.unsubscribe(&connection_id);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.destinations
            .entry(destination.to_string())
            .or_default()
            .push(Subscriber {
                connection_id: connection_id.clone(),
                sender: tx,
            });
        self.connections
            .insert(connection_id.clone(), destination.to_string());
        SUBSCRIBERS.set(self.connections.len() as i64);

        info!(
            destination = %destination,
            connection_id = %connection_id,
            "Subscriber attached"
        );

        rx
    }

    /// Detach a connection. Returns whether it was known.
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        let Some((_, destination)) = self.connections.remove(connection_id) else {
            debug!(connection_id = %connection_id, "Unsubscribe for unknown connection");
            return false;
        };

        if let Some(mut subscribers) = self.destinations.get_mut(&destination) {
            subscribers.retain(|sub| sub.connection_id != connection_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.destinations
                    .remove_if(&destination, |_, subs| subs.is_empty());
            }
        }
        SUBSCRIBERS.set(self.connections.len() as i64);

        info!(
            destination = %destination,
            connection_id = %connection_id,
            "Subscriber detached"
        );
        true
    }

    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.destinations
            .get(destination)
            .map_or(0, |subscribers| subscribers.len())
    }

    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastSink for SubscriberRegistry {
    fn broadcast(&self, destination: &str, payload: Bytes) -> Result<BroadcastReport> {
        let snapshot: Vec<Subscriber> = self
            .destinations
            .get(destination)
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default();

        let mut report = BroadcastReport::default();
        let mut stale = Vec::new();

        for subscriber in &snapshot {
            match subscriber.sender.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(
                        destination = %destination,
                        connection_id = %subscriber.connection_id,
                        "Subscriber buffer full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    report.removed += 1;
                    warn!(
                        destination = %destination,
                        connection_id = %subscriber.connection_id,
                        "Subscriber connection closed, removing"
                    );
                    stale.push(subscriber.connection_id.clone());
                }
            }
        }

        for connection_id in stale {
            self.unsubscribe(&connection_id);
        }

        BROADCAST_TOTAL
            .with_label_values(&["delivered"])
            .inc_by(report.delivered as u64);
        BROADCAST_TOTAL
            .with_label_values(&["dropped"])
            .inc_by(report.dropped as u64);
        BROADCAST_TOTAL
            .with_label_values(&["removed"])
            .inc_by(report.removed as u64);

        debug!(
            destination = %destination,
            delivered = report.delivered,
            dropped = report.dropped,
            removed = report.removed,
            "Broadcast complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "/topic/persons/live";

    #[tokio::test]
    async fn test_subscribe_and_broadcast() {
        let registry = SubscriberRegistry::new(8);
        let mut rx = registry.subscribe(LIVE, "conn1".to_string());

        assert_eq!(registry.subscriber_count(LIVE), 1);
        assert_eq!(registry.connection_count(), 1);

        let report = registry
            .broadcast(LIVE, Bytes::from_static(b"{\"id\":\"p1\"}"))
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"{\"id\":\"p1\"}"));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let registry = SubscriberRegistry::new(8);
        let _rx = registry.subscribe(LIVE, "conn1".to_string());

        assert!(registry.unsubscribe("conn1"));
        assert!(!registry.unsubscribe("conn1"));
        assert_eq!(registry.subscriber_count(LIVE), 0);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.destination_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_without_affecting_others() {
        let registry = SubscriberRegistry::new(8);
        let mut healthy = registry.subscribe(LIVE, "a".to_string());
        let broken = registry.subscribe(LIVE, "b".to_string());
        drop(broken);

        let report = registry.broadcast(LIVE, Bytes::from_static(b"x")).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(healthy.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(registry.subscriber_count(LIVE), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_only_for_slow_subscriber() {
        let registry = SubscriberRegistry::new(1);
        let mut slow = registry.subscribe(LIVE, "slow".to_string());
        let mut fast = registry.subscribe(LIVE, "fast".to_string());

        registry.broadcast(LIVE, Bytes::from_static(b"1")).unwrap();
        assert_eq!(fast.recv().await.unwrap(), Bytes::from_static(b"1"));

        let report = registry.broadcast(LIVE, Bytes::from_static(b"2")).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(fast.recv().await.unwrap(), Bytes::from_static(b"2"));

        // The slow subscriber stays registered and still has the first message
        assert_eq!(slow.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(registry.subscriber_count(LIVE), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_moves_connection() {
        let registry = SubscriberRegistry::new(8);
        let _old = registry.subscribe("/a", "conn1".to_string());
        let _new = registry.subscribe("/b", "conn1".to_string());

        assert_eq!(registry.subscriber_count("/a"), 0);
        assert_eq!(registry.subscriber_count("/b"), 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_broadcast_to_empty_destination() {
        let registry = SubscriberRegistry::default();
        let report = registry.broadcast(LIVE, Bytes::new()).unwrap();
        assert_eq!(report.attempted(), 0);
    }
}
