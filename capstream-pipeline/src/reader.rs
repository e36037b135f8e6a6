//! Change Cursor Reader
//!
//! Turns the store's tail cursor into an endless record stream that
//! survives cursor failures. Every (re)connection opens a fresh cursor at
//! "now", so records appended while disconnected are skipped and nothing
//! read before a failure is seen twice.

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use capstream_core::config::RetryPolicy;
use capstream_core::metrics::{READER_RECONNECTS, READER_STATE, RECORDS_READ};
use capstream_core::models::Record;
use capstream_core::resilience::backoff::Backoff;
use capstream_core::resilience::circuit_breaker::Breaker;
use capstream_core::store::{BoundedStore, RecordStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    Starting,
    Streaming,
    Error,
    Reconnecting,
    Stopped,
}

impl ReaderState {
    /// Value exported through the `capstream_reader_state` gauge
    #[must_use]
    pub const fn as_gauge(self) -> i64 {
        match self {
            Self::Starting => 0,
            Self::Streaming => 1,
            Self::Error => 2,
            Self::Reconnecting => 3,
            Self::Stopped => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderStatus {
    pub state: ReaderState,
    /// Cursors opened so far; grows by one on every successful reconnect
    pub sessions: u64,
}

pub struct ChangeCursorReader {
    store: Arc<dyn BoundedStore>,
    collection: String,
    policy: RetryPolicy,
    status: watch::Sender<ReaderStatus>,
}

impl ChangeCursorReader {
    #[must_use]
    pub fn new(store: Arc<dyn BoundedStore>, collection: impl Into<String>, policy: RetryPolicy) -> Self {
        let (status, _) = watch::channel(ReaderStatus {
            state: ReaderState::Starting,
            sessions: 0,
        });
        Self {
            store,
            collection: collection.into(),
            policy,
            status,
        }
    }

    /// Watch state transitions and reconnects
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ReaderStatus> {
        self.status.subscribe()
    }

    /// Start following the collection. The stream ends only once `cancel`
    /// fires; the reader is consumed, so it can be subscribed once.
    pub fn subscribe(self, cancel: CancellationToken) -> BoxStream<'static, Record> {
        let session = Session {
            breaker: Breaker::from_policy(&self.policy.breaker),
            backoff: Backoff::new(self.policy),
            reader: self,
            cancel,
            cursor: None,
        };

        futures::stream::unfold(session, |mut session| async move {
            session.next_record().await.map(|record| (record, session))
        })
        .boxed()
    }
}

struct Session {
    reader: ChangeCursorReader,
    cancel: CancellationToken,
    backoff: Backoff,
    breaker: Breaker,
    cursor: Option<RecordStream>,
}

impl Session {
    fn set_state(&self, state: ReaderState) {
        self.reader.status.send_modify(|status| status.state = state);
        READER_STATE.set(state.as_gauge());
    }

    fn stop(&mut self) {
        self.cursor = None;
        self.set_state(ReaderState::Stopped);
        info!(collection = %self.reader.collection, "Change cursor reader stopped");
    }

    async fn next_record(&mut self) -> Option<Record> {
        loop {
            if self.cancel.is_cancelled() {
                self.stop();
                return None;
            }

            let Some(cursor) = self.cursor.as_mut() else {
                if !self.open().await {
                    return None;
                }
                continue;
            };

            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.stop();
                    return None;
                }
                item = cursor.next() => item,
            };

            match item {
                Some(Ok(record)) => {
                    self.backoff.reset();
                    self.breaker.on_success();
                    RECORDS_READ.inc();
                    debug!(
                        collection = %self.reader.collection,
                        key = %record.key(),
                        "Read record from change cursor"
                    );
                    return Some(record);
                }
                Some(Err(e)) => {
                    self.cursor = None;
                    self.breaker.on_error();
                    self.set_state(ReaderState::Error);
                    error!(
                        collection = %self.reader.collection,
                        error = %e,
                        "Change cursor failed"
                    );
                    if !self.wait_before_reconnect().await {
                        return None;
                    }
                }
                None => {
                    self.cursor = None;
                    self.set_state(ReaderState::Error);
                    warn!(
                        collection = %self.reader.collection,
                        "Change cursor completed unexpectedly, resubscribing"
                    );
                    if !self.wait_before_reconnect().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Open a fresh cursor. Returns `false` when cancelled.
    async fn open(&mut self) -> bool {
        if !self.breaker.is_call_permitted() {
            warn!(
                collection = %self.reader.collection,
                "Reader circuit open, holding off reconnect"
            );
            return self.sleep(self.backoff.policy().max_delay()).await;
        }

        self.set_state(ReaderState::Starting);
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.stop();
                return false;
            }
            opened = self.reader.store.tail(&self.reader.collection) => opened,
        };

        match opened {
            Ok(cursor) => {
                self.breaker.on_success();
                self.cursor = Some(cursor);
                self.reader.status.send_modify(|status| {
                    status.state = ReaderState::Streaming;
                    status.sessions += 1;
                });
                READER_STATE.set(ReaderState::Streaming.as_gauge());
                info!(
                    collection = %self.reader.collection,
                    sessions = self.reader.status.borrow().sessions,
                    "Change cursor streaming"
                );
                true
            }
            Err(e) => {
                self.breaker.on_error();
                self.set_state(ReaderState::Error);
                error!(
                    collection = %self.reader.collection,
                    error = %e,
                    "Failed to open change cursor"
                );
                self.wait_before_reconnect().await
            }
        }
    }

    async fn wait_before_reconnect(&mut self) -> bool {
        self.set_state(ReaderState::Reconnecting);
        READER_RECONNECTS.inc();
        let delay = self.backoff.next_delay();
        warn!(
            collection = %self.reader.collection,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting change cursor after delay"
        );
        self.sleep(delay).await
    }

    /// Cancellable sleep. Returns `false` when cancelled.
    async fn sleep(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => {
                self.stop();
                false
            }
            () = tokio::time::sleep(delay) => true,
        }
    }
}
