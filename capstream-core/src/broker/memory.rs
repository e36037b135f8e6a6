use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{Broker, Delivery, DeliveryStream, PublishAck};
use crate::config::OffsetReset;
use crate::{Error, Result};

struct Entry {
    offset: u64,
    key: String,
    payload: Bytes,
}

impl Entry {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            id: self.offset.to_string(),
            key: self.key.clone(),
            payload: self.payload.clone(),
        }
    }
}

struct Topic {
    log: VecDeque<Entry>,
    next_offset: u64,
    /// Next offset to hand out, per group
    groups: HashMap<String, u64>,
    changes: watch::Sender<u64>,
}

impl Topic {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            log: VecDeque::new(),
            next_offset: 0,
            groups: HashMap::new(),
            changes,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn first_offset(&self) -> u64 {
        self.log.front().map_or(self.next_offset, |e| e.offset)
    }
}

struct Inner {
    topics: HashMap<String, Topic>,
    available: bool,
}

/// In-process broker with a bounded retained log per topic
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    max_len: usize,
    offset_reset: OffsetReset,
}

impl MemoryBroker {
    #[must_use]
    pub fn new(max_len: usize, offset_reset: OffsetReset) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                topics: HashMap::new(),
                available: true,
            })),
            max_len: max_len.max(1),
            offset_reset,
        }
    }

    /// Simulate the broker going away (or coming back). Open subscriptions
    /// fail as soon as it becomes unavailable.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock();
        inner.available = available;
        for topic in inner.topics.values() {
            topic.notify();
        }
    }

    /// Messages currently retained on a topic, oldest first
    #[must_use]
    pub fn history(&self, topic: &str) -> Vec<Delivery> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|t| t.log.iter().map(Entry::to_delivery).collect())
            .unwrap_or_default()
    }

    fn check_available(inner: &Inner) -> Result<()> {
        if inner.available {
            Ok(())
        } else {
            Err(Error::Broker("memory broker is unavailable".to_string()))
        }
    }

    /// Claim the next message for the group, `Ok(None)` when caught up
    fn claim(&self, topic: &str, group: &str) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let Some(topic) = inner.topics.get_mut(topic) else {
            return Ok(None);
        };
        let first = topic.first_offset();
        let cursor = topic.groups.entry(group.to_string()).or_insert(first);
        // Entries trimmed while the group lagged are skipped
        let position = (*cursor).max(first);
        let idx = usize::try_from(position - first).unwrap_or(usize::MAX);
        match topic.log.get(idx) {
            Some(entry) => {
                *cursor = entry.offset + 1;
                Ok(Some(entry.to_delivery()))
            }
            None => {
                *cursor = position;
                Ok(None)
            }
        }
    }
}

struct SubscriptionState {
    broker: MemoryBroker,
    topic: String,
    group: String,
    changes: watch::Receiver<u64>,
    done: bool,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<PublishAck> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let target = inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new);

        let offset = target.next_offset;
        target.next_offset += 1;
        target.log.push_back(Entry {
            offset,
            key: key.to_string(),
            payload,
        });
        while target.log.len() > self.max_len {
            target.log.pop_front();
        }
        target.notify();

        Ok(PublishAck {
            topic: topic.to_string(),
            offset: offset.to_string(),
        })
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream> {
        let changes = {
            let mut inner = self.inner.lock();
            Self::check_available(&inner)?;
            let target = inner
                .topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new);
            if !target.groups.contains_key(group) {
                let start = match self.offset_reset {
                    OffsetReset::Earliest => target.first_offset(),
                    OffsetReset::Latest => target.next_offset,
                };
                target.groups.insert(group.to_string(), start);
                debug!(topic, group, start, "Created consumer group");
            }
            target.changes.subscribe()
        };

        let state = SubscriptionState {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            changes,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                state.changes.borrow_and_update();
                match state.broker.claim(&state.topic, &state.group) {
                    Ok(Some(delivery)) => return Some((Ok(delivery), state)),
                    Ok(None) => {
                        if state.changes.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, _topic: &str, _group: &str, _delivery: &Delivery) -> Result<()> {
        // Claiming already advanced the group cursor
        Self::check_available(&self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_keeps_order_and_key() {
        let broker = MemoryBroker::new(100, OffsetReset::Earliest);
        for key in ["p1", "p2", "p3"] {
            broker
                .publish("person-events", key, Bytes::from(key.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let keys: Vec<_> = broker
            .history("person-events")
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_retained_log_is_bounded() {
        let broker = MemoryBroker::new(2, OffsetReset::Earliest);
        for key in ["p1", "p2", "p3"] {
            broker.publish("t", key, Bytes::new()).await.unwrap();
        }
        let keys: Vec<_> = broker.history("t").into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn test_earliest_group_sees_retained_messages() {
        let broker = MemoryBroker::new(100, OffsetReset::Earliest);
        broker.publish("t", "old", Bytes::new()).await.unwrap();

        let mut stream = broker.subscribe("t", "g").await.unwrap();
        broker.publish("t", "new", Bytes::new()).await.unwrap();

        assert_eq!(next(&mut stream).await.key, "old");
        assert_eq!(next(&mut stream).await.key, "new");
    }

    #[tokio::test]
    async fn test_latest_group_skips_retained_messages() {
        let broker = MemoryBroker::new(100, OffsetReset::Latest);
        broker.publish("t", "old", Bytes::new()).await.unwrap();

        let mut stream = broker.subscribe("t", "g").await.unwrap();
        broker.publish("t", "new", Bytes::new()).await.unwrap();

        assert_eq!(next(&mut stream).await.key, "new");
    }

    #[tokio::test]
    async fn test_group_position_survives_resubscribe() {
        let broker = MemoryBroker::new(100, OffsetReset::Earliest);
        broker.publish("t", "p1", Bytes::new()).await.unwrap();
        broker.publish("t", "p2", Bytes::new()).await.unwrap();

        let mut first = broker.subscribe("t", "g").await.unwrap();
        let delivery = next(&mut first).await;
        broker.ack("t", "g", &delivery).await.unwrap();
        drop(first);

        let mut second = broker.subscribe("t", "g").await.unwrap();
        assert_eq!(next(&mut second).await.key, "p2");
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let broker = MemoryBroker::new(100, OffsetReset::Earliest);
        broker.publish("t", "p1", Bytes::new()).await.unwrap();

        let mut a = broker.subscribe("t", "a").await.unwrap();
        let mut b = broker.subscribe("t", "b").await.unwrap();
        assert_eq!(next(&mut a).await.key, "p1");
        assert_eq!(next(&mut b).await.key, "p1");
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_subscription() {
        let broker = MemoryBroker::new(100, OffsetReset::Earliest);
        let mut stream = broker.subscribe("t", "g").await.unwrap();

        broker.set_available(false);

        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Err(Error::Broker(_))));
        assert!(stream.next().await.is_none());
        assert!(broker.publish("t", "p1", Bytes::new()).await.is_err());
    }
}
