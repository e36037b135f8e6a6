//! Durable topic brokers
//!
//! A broker keeps an ordered, retained log per topic. Consumers join a
//! group; every message on the topic is handed to exactly one consumer of
//! each group, and the group's position survives consumer restarts.

pub mod memory;
pub mod redis_stream;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::MemoryBroker;
pub use redis_stream::RedisStreamBroker;

/// Confirmation that a message was durably appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub topic: String,
    /// Broker-assigned position of the message in the topic
    pub offset: String,
}

/// One message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub key: String,
    pub payload: Bytes,
}

/// Messages for a consumer group, in topic order.
///
/// An `Err` item ends the subscription; the consumer is expected to
/// subscribe again.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<PublishAck>;

    /// Join `group` on `topic`, creating the group if needed
    async fn subscribe(&self, topic: &str, group: &str) -> Result<DeliveryStream>;

    /// Mark a delivery as processed for the group
    async fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<()>;
}
