//! Topic Consumer / Broadcast Router
//!
//! Reads the topic as a member of a consumer group and pushes every record
//! to one fixed destination on the broadcast sink.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use capstream_core::broker::{Broker, Delivery, DeliveryStream};
use capstream_core::config::RetryPolicy;
use capstream_core::metrics::BROADCAST_TOTAL;
use capstream_core::models::TopicMessage;
use capstream_core::resilience::backoff::Backoff;
use capstream_core::resilience::circuit_breaker::Breaker;
use capstream_core::Result;

use crate::sink::{BroadcastReport, BroadcastSink};

pub struct BroadcastRouter {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn BroadcastSink>,
    topic: String,
    group: String,
    destination: String,
    policy: RetryPolicy,
}

/// How a subscription ended
enum ConsumerExit {
    Cancelled,
    /// The subscription was up; `received` tells whether anything arrived
    Disconnected { received: bool },
    SubscribeFailed,
}

impl BroadcastRouter {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn BroadcastSink>,
        topic: impl Into<String>,
        group: impl Into<String>,
        destination: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            sink,
            topic: topic.into(),
            group: group.into(),
            destination: destination.into(),
            policy,
        }
    }

    /// Decode one delivery and fan it out. The payload sent to subscribers
    /// is the record's JSON, without the topic envelope.
    pub fn route(&self, delivery: &Delivery) -> Result<BroadcastReport> {
        let message = TopicMessage::decode(&delivery.payload)?;
        let payload = Bytes::from(message.record.to_json()?);
        self.sink.broadcast(&self.destination, payload)
    }

    /// Consume until cancelled, resubscribing with backoff whenever the
    /// subscription fails.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.policy);
        let breaker = Breaker::from_policy(&self.policy.breaker);

        info!(
            topic = %self.topic,
            group = %self.group,
            destination = %self.destination,
            "Broadcast router started"
        );

        loop {
            let delay = if breaker.is_call_permitted() {
                match self.consume(&cancel).await {
                    ConsumerExit::Cancelled => break,
                    ConsumerExit::Disconnected { received } => {
                        if received {
                            backoff.reset();
                            breaker.on_success();
                        } else {
                            breaker.on_error();
                        }
                        backoff.next_delay()
                    }
                    ConsumerExit::SubscribeFailed => {
                        breaker.on_error();
                        backoff.next_delay()
                    }
                }
            } else {
                warn!(topic = %self.topic, "Router circuit open, holding off resubscribe");
                self.policy.max_delay()
            };

            warn!(
                topic = %self.topic,
                group = %self.group,
                delay_ms = delay.as_millis() as u64,
                "Resubscribing to topic after delay"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(topic = %self.topic, "Broadcast router stopped");
    }

    async fn consume(&self, cancel: &CancellationToken) -> ConsumerExit {
        let subscribed = tokio::select! {
            biased;
            () = cancel.cancelled() => return ConsumerExit::Cancelled,
            subscribed = self.broker.subscribe(&self.topic, &self.group) => subscribed,
        };
        let mut deliveries: DeliveryStream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    topic = %self.topic,
                    group = %self.group,
                    error = %e,
                    "Failed to subscribe to topic"
                );
                return ConsumerExit::SubscribeFailed;
            }
        };

        info!(topic = %self.topic, group = %self.group, "Subscribed to topic");
        let mut received = false;

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return ConsumerExit::Cancelled,
                item = deliveries.next() => item,
            };

            let delivery = match item {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(topic = %self.topic, error = %e, "Topic subscription failed");
                    return ConsumerExit::Disconnected { received };
                }
                None => {
                    warn!(topic = %self.topic, "Topic subscription ended");
                    return ConsumerExit::Disconnected { received };
                }
            };
            received = true;

            match self.route(&delivery) {
                Ok(report) => debug!(
                    topic = %self.topic,
                    key = %delivery.key,
                    destination = %self.destination,
                    delivered = report.delivered,
                    "Routed message"
                ),
                Err(e) => {
                    BROADCAST_TOTAL.with_label_values(&["error"]).inc();
                    warn!(
                        topic = %self.topic,
                        key = %delivery.key,
                        error = %e,
                        "Failed to route message, skipping"
                    );
                }
            }

            if let Err(e) = self.broker.ack(&self.topic, &self.group, &delivery).await {
                warn!(
                    topic = %self.topic,
                    delivery_id = %delivery.id,
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        }
    }
}
