use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use capstream_core::broker::{Broker, PublishAck};
use capstream_core::config::BreakerPolicy;
use capstream_core::metrics::PUBLISH_TOTAL;
use capstream_core::models::{Record, TopicMessage};
use capstream_core::resilience::circuit_breaker::Breaker;
use capstream_core::{Error, Result};

/// Forwards records onto a broker topic as versioned [`TopicMessage`]s
pub struct TopicPublisher {
    broker: Arc<dyn Broker>,
    topic: String,
    publish_timeout: Duration,
    breaker: Breaker,
}

impl TopicPublisher {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        publish_timeout: Duration,
        breaker: &BreakerPolicy,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            publish_timeout,
            breaker: Breaker::from_policy(breaker),
        }
    }

    /// Publish one record and wait for the broker's acknowledgment
    pub async fn publish(&self, record: Record) -> Result<PublishAck> {
        if !self.breaker.is_call_permitted() {
            return Err(Error::Broker(format!(
                "publish circuit open for topic '{}'",
                self.topic
            )));
        }
        self.send(record).await
    }

    async fn send(&self, record: Record) -> Result<PublishAck> {
        let message = TopicMessage::new(record);
        let payload = message.encode()?;

        let result = match timeout(
            self.publish_timeout,
            self.broker.publish(&self.topic, &message.key, payload.into()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "publish to '{}' timed out",
                self.topic
            ))),
        };

        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(e) if e.is_transient() => self.breaker.on_error(),
            Err(_) => {}
        }
        result
    }

    /// Publish and log the outcome; failures drop the record
    async fn deliver(&self, record: Record) {
        let key = record.key().to_string();

        if !self.breaker.is_call_permitted() {
            PUBLISH_TOTAL.with_label_values(&["dropped"]).inc();
            warn!(topic = %self.topic, key = %key, "Publish circuit open, dropping record");
            return;
        }

        match self.send(record).await {
            Ok(ack) => {
                PUBLISH_TOTAL.with_label_values(&["ok"]).inc();
                info!(
                    topic = %ack.topic,
                    key = %key,
                    offset = %ack.offset,
                    "Published record"
                );
            }
            Err(e) => {
                PUBLISH_TOTAL.with_label_values(&["error"]).inc();
                error!(
                    topic = %self.topic,
                    key = %key,
                    error = %e,
                    "Failed to publish record, dropping"
                );
            }
        }
    }

    /// Run the publisher on `tracker`, fed through a bounded queue.
    ///
    /// Records are published one at a time in submission order. On
    /// cancellation the in-flight publish and anything still queued are
    /// abandoned.
    pub fn start(
        self,
        capacity: usize,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> PublisherHandle {
        let (tx, mut rx) = mpsc::channel::<Record>(capacity.max(1));
        let topic = self.topic.clone();
        let span = info_span!("publisher", topic = %topic);

        tracker.spawn(
            async move {
                info!(topic = %self.topic, "Topic publisher started");
                loop {
                    let record = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        record = rx.recv() => record,
                    };
                    let Some(record) = record else {
                        break;
                    };
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.deliver(record) => {}
                    }
                }
                info!(topic = %self.topic, "Topic publisher stopped");
            }
            .instrument(span),
        );

        PublisherHandle { tx, topic }
    }
}

/// Non-blocking entry point into a running publisher
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<Record>,
    topic: String,
}

impl PublisherHandle {
    /// Queue a record for publishing without waiting. Returns `false` when
    /// the record was dropped because the queue is full or closed.
    pub fn submit(&self, record: Record) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                PUBLISH_TOTAL.with_label_values(&["dropped"]).inc();
                warn!(
                    topic = %self.topic,
                    key = %record.key(),
                    "Publish queue full, dropping record"
                );
                false
            }
            Err(TrySendError::Closed(record)) => {
                PUBLISH_TOTAL.with_label_values(&["dropped"]).inc();
                warn!(
                    topic = %self.topic,
                    key = %record.key(),
                    "Publisher stopped, dropping record"
                );
                false
            }
        }
    }
}
