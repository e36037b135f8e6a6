//! Pipeline lifecycle
//!
//! Wires the four stages together and owns their tasks:
//!
//! 1. Bounded Store Manager, awaited before anything else starts
//! 2. Broadcast Router, consuming the topic
//! 3. Topic Publisher, fed through a bounded queue
//! 4. Change Cursor Reader, feeding the publisher

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use capstream_core::broker::Broker;
use capstream_core::config::{BreakerPolicy, Config, RetryPolicy};
use capstream_core::store::{BoundedSpec, BoundedStore, EnsureOutcome};
use capstream_core::Result;

use crate::bounded::BoundedStoreManager;
use crate::publisher::TopicPublisher;
use crate::reader::{ChangeCursorReader, ReaderStatus};
use crate::router::BroadcastRouter;
use crate::sink::BroadcastSink;

/// Everything the pipeline needs to know, independent of where it came from
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub store: BoundedSpec,
    pub topic: String,
    pub group: String,
    pub destination: String,
    pub publish_timeout: Duration,
    pub publish_queue_capacity: usize,
    pub publish_breaker: BreakerPolicy,
    pub reconnect: RetryPolicy,
}

impl PipelineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            store: BoundedSpec::new(
                config.store.collection.clone(),
                config.store.capacity_bytes,
                config.store.max_count,
            ),
            topic: config.broker.topic.clone(),
            group: config.broker.group.clone(),
            destination: config.pipeline.destination.clone(),
            publish_timeout: config.broker.publish_timeout(),
            publish_queue_capacity: config.pipeline.publish_queue_capacity,
            publish_breaker: config.pipeline.publish_breaker,
            reconnect: config.pipeline.reconnect,
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Bound the store, then start the router, publisher and reader.
    ///
    /// Fails only when the store cannot be bounded; once this returns, all
    /// stages recover from collaborator failures on their own.
    pub async fn start(
        settings: PipelineSettings,
        store: Arc<dyn BoundedStore>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<PipelineHandle> {
        // 1. The store must be bounded before the reader may tail it
        let outcome = BoundedStoreManager::new(store.clone())
            .ensure(&settings.store)
            .await?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        // 2. Router
        let router = BroadcastRouter::new(
            broker.clone(),
            sink,
            settings.topic.clone(),
            settings.group.clone(),
            settings.destination.clone(),
            settings.reconnect,
        );
        tracker.spawn(router.run(cancel.clone()).instrument(info_span!(
            "router",
            topic = %settings.topic,
            group = %settings.group
        )));

        // 3. Publisher
        let publisher = TopicPublisher::new(
            broker,
            settings.topic.clone(),
            settings.publish_timeout,
            &settings.publish_breaker,
        )
        .start(settings.publish_queue_capacity, &tracker, cancel.clone());

        // 4. Reader
        let reader = ChangeCursorReader::new(store, settings.store.name.clone(), settings.reconnect);
        let status = reader.status();
        let mut records = reader.subscribe(cancel.clone());
        tracker.spawn(
            async move {
                while let Some(record) = records.next().await {
                    publisher.submit(record);
                }
            }
            .instrument(info_span!("reader", collection = %settings.store.name)),
        );

        tracker.close();

        info!(
            collection = %settings.store.name,
            topic = %settings.topic,
            destination = %settings.destination,
            "Pipeline started"
        );

        Ok(PipelineHandle {
            cancel,
            tracker,
            status,
            outcome,
        })
    }
}

/// Control surface of a running pipeline
pub struct PipelineHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
    status: watch::Receiver<ReaderStatus>,
    outcome: EnsureOutcome,
}

impl PipelineHandle {
    #[must_use]
    pub fn reader_status(&self) -> watch::Receiver<ReaderStatus> {
        self.status.clone()
    }

    /// What the startup bounding check had to do
    #[must_use]
    pub const fn bounding_outcome(&self) -> EnsureOutcome {
        self.outcome
    }

    /// Signal every stage to stop without waiting for them
    pub fn stop(&self) {
        info!("Stopping pipeline");
        self.cancel.cancel();
    }

    /// Stop and wait up to `grace` for the stages to wind down. Returns
    /// `false` if some task was still running when the grace period ran out.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.stop();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("Pipeline stopped");
            true
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                remaining = self.tracker.len(),
                "Pipeline tasks still running after grace period"
            );
            false
        }
    }
}
