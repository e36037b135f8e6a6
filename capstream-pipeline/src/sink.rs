use bytes::Bytes;
use serde::Serialize;

use capstream_core::Result;

/// Outcome of fanning one payload out to a destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Subscribers whose buffer accepted the payload
    pub delivered: usize,
    /// Subscribers skipped because their buffer was full
    pub dropped: usize,
    /// Subscribers found disconnected and removed
    pub removed: usize,
}

impl BroadcastReport {
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.removed
    }
}

/// Capability to push a payload to every live connection on a destination.
///
/// Implementations must not block on any single subscriber.
#[cfg_attr(test, mockall::automock)]
pub trait BroadcastSink: Send + Sync {
    fn broadcast(&self, destination: &str, payload: Bytes) -> Result<BroadcastReport>;
}
