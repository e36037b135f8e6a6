//! Size- and count-bounded append-only stores
//!
//! A bounded store evicts its oldest records by itself whenever an insert
//! would push it past either limit. Readers never evict and never see
//! evicted records; they only follow new appends through [`BoundedStore::tail`].

pub mod memory;
pub mod redis_stream;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::models::Record;
use crate::Result;

pub use memory::MemoryStore;
pub use redis_stream::RedisStreamStore;

/// Live feed of newly appended records, in insertion order.
///
/// An `Err` item means the cursor is no longer usable; the stream ends
/// right after it. A stream that ends without an error is also a broken
/// cursor from the reader's point of view.
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Limits a collection must be configured with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedSpec {
    pub name: String,
    pub capacity_bytes: u64,
    pub max_count: u64,
}

impl BoundedSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity_bytes: u64, max_count: u64) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            max_count,
        }
    }
}

/// What `ensure_bounded` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// The collection did not exist and was created bounded
    Created,
    /// The collection already had exactly the requested limits
    AlreadyBounded,
    /// The collection existed unbounded (or with other limits) and was
    /// dropped and recreated; its previous contents are gone
    Recreated,
}

/// Current shape of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    /// `None` when the collection is a plain, unbounded one
    pub bounds: Option<BoundedSpec>,
    pub count: u64,
    pub bytes: u64,
}

impl CollectionInfo {
    #[must_use]
    pub fn is_bounded_as(&self, spec: &BoundedSpec) -> bool {
        self.bounds.as_ref() == Some(spec)
    }
}

#[async_trait]
pub trait BoundedStore: Send + Sync {
    /// Make sure the collection exists with exactly these limits
    async fn ensure_bounded(&self, spec: &BoundedSpec) -> Result<EnsureOutcome>;

    /// Append a record, assigning an id when it has none. Returns the
    /// record as stored.
    async fn insert(&self, collection: &str, record: Record) -> Result<Record>;

    /// Follow the collection from "now": only records appended after this
    /// call returns are yielded.
    async fn tail(&self, collection: &str) -> Result<RecordStream>;

    /// Records currently retained, oldest first
    async fn snapshot(&self, collection: &str) -> Result<Vec<Record>>;

    /// Shape of the collection, `None` when it does not exist
    async fn describe(&self, collection: &str) -> Result<Option<CollectionInfo>>;
}
