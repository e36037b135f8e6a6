use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::VecDeque;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::{Broker, Delivery, DeliveryStream, PublishAck};
use crate::config::{BrokerConfig, OffsetReset, RedisConfig};
use crate::{Error, Result};

/// Broker on top of Redis Streams consumer groups
///
/// Topics live at `{prefix}topic:{topic}` and are trimmed with an
/// approximate `MAXLEN`. Each node reads as its own consumer inside the
/// group, so the group's pending list tells which node holds a message.
pub struct RedisStreamBroker {
    client: RedisClient,
    conn: ConnectionManager,
    key_prefix: String,
    consumer: String,
    max_len: usize,
    offset_reset: OffsetReset,
    read_block_ms: u64,
    read_batch_size: usize,
    operation_timeout: Duration,
    connect_timeout: Duration,
}

impl RedisStreamBroker {
    pub async fn connect(redis: &RedisConfig, broker: &BrokerConfig, node_id: String) -> Result<Self> {
        let client = RedisClient::open(redis.url.as_str())?;
        let conn = timeout(redis.connect_timeout(), ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        debug!(url = %redis.url, consumer = %node_id, "Connected broker to Redis");

        Ok(Self {
            client,
            conn,
            key_prefix: redis.key_prefix.clone(),
            consumer: node_id,
            max_len: broker.topic_max_len,
            offset_reset: broker.offset_reset,
            read_block_ms: broker.read_block_ms.max(1),
            read_batch_size: broker.read_batch_size.max(1),
            operation_timeout: redis.operation_timeout(),
            connect_timeout: redis.connect_timeout(),
        })
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}topic:{}", self.key_prefix, topic)
    }

    const fn group_start(&self) -> &'static str {
        match self.offset_reset {
            OffsetReset::Earliest => "0",
            OffsetReset::Latest => "$",
        }
    }
}

fn delivery_from_entry(entry: &redis::streams::StreamId) -> Option<Delivery> {
    let key = entry.get::<String>("key")?;
    let payload = entry.get::<Vec<u8>>("payload")?;
    Some(Delivery {
        id: entry.id.clone(),
        key,
        payload: Bytes::from(payload),
    })
}

struct SubscriptionState {
    conn: MultiplexedConnection,
    topic_key: String,
    group: String,
    consumer: String,
    pending: VecDeque<Delivery>,
    block_ms: u64,
    batch_size: usize,
    operation_timeout: Duration,
    done: bool,
}

impl SubscriptionState {
    async fn fill(&mut self) -> Result<()> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(self.block_ms as usize)
            .count(self.batch_size);
        let deadline = Duration::from_millis(self.block_ms) + self.operation_timeout;

        let reply: Option<StreamReadReply> = match timeout(
            deadline,
            self.conn.xread_options(&[&self.topic_key], &[">"], &options),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) if e.is_timeout() => None,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "group read on '{}' timed out",
                    self.topic_key
                )))
            }
        };

        for stream in reply.into_iter().flat_map(|r| r.keys) {
            for entry in stream.ids {
                match delivery_from_entry(&entry) {
                    Some(delivery) => self.pending.push_back(delivery),
                    None => {
                        warn!(entry_id = %entry.id, "Skipping malformed topic entry");
                        let _: redis::RedisResult<i64> = self
                            .conn
                            .xack(&self.topic_key, &self.group, &[&entry.id])
                            .await;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<PublishAck> {
        let mut conn = self.conn.clone();
        let topic_key = self.topic_key(topic);

        let offset: String = timeout(
            self.operation_timeout,
            conn.xadd_maxlen(
                &topic_key,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[("key", key.as_bytes()), ("payload", payload.as_ref())],
            ),
        )
        .await
        .map_err(|_| Error::Timeout(format!("publish to '{topic}' timed out")))??;

        Ok(PublishAck {
            topic: topic.to_string(),
            offset,
        })
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream> {
        let mut conn = timeout(self.connect_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;
        let topic_key = self.topic_key(topic);

        let created: redis::RedisResult<()> = timeout(
            self.operation_timeout,
            conn.xgroup_create_mkstream(&topic_key, group, self.group_start()),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XGROUP CREATE timed out".to_string()))?;
        match created {
            Ok(()) => info!(topic, group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        let state = SubscriptionState {
            conn,
            topic_key,
            group: group.to_string(),
            consumer: self.consumer.clone(),
            pending: VecDeque::new(),
            block_ms: self.read_block_ms,
            batch_size: self.read_batch_size,
            operation_timeout: self.operation_timeout,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if let Some(delivery) = state.pending.pop_front() {
                    return Some((Ok(delivery), state));
                }
                if let Err(e) = state.fill().await {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let topic_key = self.topic_key(topic);
        let _acked: i64 = timeout(
            self.operation_timeout,
            conn.xack(&topic_key, group, &[&delivery.id]),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XACK timed out".to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn broker(offset_reset: OffsetReset) -> RedisStreamBroker {
        let redis = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: format!("capstream-test:{}:", nanoid::nanoid!(8)),
            ..RedisConfig::default()
        };
        let config = BrokerConfig {
            offset_reset,
            read_block_ms: 200,
            ..BrokerConfig::default()
        };
        RedisStreamBroker::connect(&redis, &config, "node-test".to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_then_consume_in_group() {
        let broker = broker(OffsetReset::Earliest).await;
        broker
            .publish("person-events", "p1", Bytes::from_static(b"one"))
            .await
            .unwrap();

        let mut stream = broker.subscribe("person-events", "g").await.unwrap();
        broker
            .publish("person-events", "p2", Bytes::from_static(b"two"))
            .await
            .unwrap();

        for (key, payload) in [("p1", &b"one"[..]), ("p2", &b"two"[..])] {
            let delivery = timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(delivery.key, key);
            assert_eq!(delivery.payload.as_ref(), payload);
            broker.ack("person-events", "g", &delivery).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_subscribe_twice_reuses_group() {
        let broker = broker(OffsetReset::Latest).await;
        let first = broker.subscribe("t", "g").await;
        let second = broker.subscribe("t", "g").await;
        assert!(first.is_ok());
        assert!(second.is_ok());
    }
}
