use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{BoundedSpec, BoundedStore, CollectionInfo, EnsureOutcome, RecordStream};
use crate::models::{Record, RecordId};
use crate::{Error, Result};

struct Stored {
    seq: u64,
    size: u64,
    record: Record,
}

struct Collection {
    bounds: Option<BoundedSpec>,
    records: VecDeque<Stored>,
    bytes: u64,
    next_seq: u64,
    /// Bumped whenever open cursors must stop (recreation, invalidation)
    epoch: u64,
    changes: watch::Sender<u64>,
}

impl Collection {
    fn new(bounds: Option<BoundedSpec>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            bounds,
            records: VecDeque::new(),
            bytes: 0,
            next_seq: 1,
            epoch: 0,
            changes,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn reset(&mut self, bounds: Option<BoundedSpec>) {
        self.bounds = bounds;
        self.records.clear();
        self.bytes = 0;
        self.epoch += 1;
        self.notify();
    }

    fn evict_to_fit(&mut self) {
        let Some(bounds) = &self.bounds else {
            return;
        };
        while self.bytes > bounds.capacity_bytes || self.records.len() as u64 > bounds.max_count {
            match self.records.pop_front() {
                Some(evicted) => self.bytes -= evicted.size,
                None => break,
            }
        }
    }

    fn info(&self, name: &str) -> CollectionInfo {
        CollectionInfo {
            name: name.to_string(),
            bounds: self.bounds.clone(),
            count: self.records.len() as u64,
            bytes: self.bytes,
        }
    }
}

struct Inner {
    collections: HashMap<String, Collection>,
    available: bool,
}

/// In-process bounded store
///
/// Behaves like a capped collection: inserts evict the oldest records once
/// the byte or count limit would be exceeded, and tail cursors follow new
/// appends without polling. Also exposes fault injection so embedders and
/// tests can break cursors or make the store unreachable.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                collections: HashMap::new(),
                available: true,
            })),
        }
    }

    /// Create a plain, unbounded collection if it does not exist yet
    pub fn create_unbounded(&self, name: &str) {
        self.inner
            .lock()
            .collections
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(None));
    }

    /// Simulate the store going away (or coming back). Open cursors fail
    /// as soon as it becomes unavailable.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock();
        inner.available = available;
        for collection in inner.collections.values() {
            collection.notify();
        }
    }

    /// Kill every open cursor on a collection without touching its data
    pub fn invalidate_cursors(&self, name: &str) {
        if let Some(collection) = self.inner.lock().collections.get_mut(name) {
            collection.epoch += 1;
            collection.notify();
        }
    }

    fn check_available(inner: &Inner) -> Result<()> {
        if inner.available {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store is unavailable".to_string()))
        }
    }

    /// Next record after `cursor`, `Ok(None)` when caught up
    fn poll_after(&self, name: &str, epoch: u64, cursor: u64) -> Result<Option<(u64, Record)>> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        let collection = inner
            .collections
            .get(name)
            .ok_or_else(|| Error::CursorInvalidated(format!("collection '{name}' was dropped")))?;
        if collection.epoch != epoch {
            return Err(Error::CursorInvalidated(format!(
                "cursor on '{name}' is no longer valid"
            )));
        }
        let idx = collection.records.partition_point(|s| s.seq <= cursor);
        Ok(collection
            .records
            .get(idx)
            .map(|stored| (stored.seq, stored.record.clone())))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct TailState {
    store: MemoryStore,
    name: String,
    epoch: u64,
    cursor: u64,
    changes: watch::Receiver<u64>,
    done: bool,
}

#[async_trait]
impl BoundedStore for MemoryStore {
    async fn ensure_bounded(&self, spec: &BoundedSpec) -> Result<EnsureOutcome> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;

        match inner.collections.get_mut(&spec.name) {
            None => {
                inner
                    .collections
                    .insert(spec.name.clone(), Collection::new(Some(spec.clone())));
                debug!(collection = %spec.name, "Created bounded collection");
                Ok(EnsureOutcome::Created)
            }
            Some(collection) if collection.bounds.as_ref() == Some(spec) => {
                Ok(EnsureOutcome::AlreadyBounded)
            }
            Some(collection) => {
                collection.reset(Some(spec.clone()));
                debug!(collection = %spec.name, "Recreated collection as bounded");
                Ok(EnsureOutcome::Recreated)
            }
        }
    }

    async fn insert(&self, collection: &str, mut record: Record) -> Result<Record> {
        let id = record.id.get_or_insert_with(RecordId::new).clone();
        if id.as_str().is_empty() {
            return Err(Error::InvalidRecord("record id must not be empty".to_string()));
        }
        let size = record.size_bytes()? as u64;

        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        let target = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::NotBounded(format!("collection '{collection}' does not exist")))?;

        let Some(bounds) = &target.bounds else {
            return Err(Error::NotBounded(format!(
                "collection '{collection}' is not bounded"
            )));
        };
        if size > bounds.capacity_bytes {
            return Err(Error::RecordTooLarge {
                size: size as usize,
                capacity: bounds.capacity_bytes,
            });
        }
        if target
            .records
            .iter()
            .any(|stored| stored.record.id.as_ref() == Some(&id))
        {
            return Err(Error::DuplicateId(id.to_string()));
        }

        let seq = target.next_seq;
        target.next_seq += 1;
        target.bytes += size;
        target.records.push_back(Stored {
            seq,
            size,
            record: record.clone(),
        });
        target.evict_to_fit();
        target.notify();

        Ok(record)
    }

    async fn tail(&self, collection: &str) -> Result<RecordStream> {
        let state = {
            let inner = self.inner.lock();
            Self::check_available(&inner)?;
            let target = inner.collections.get(collection).ok_or_else(|| {
                Error::NotBounded(format!("collection '{collection}' does not exist"))
            })?;
            if target.bounds.is_none() {
                return Err(Error::NotBounded(format!(
                    "collection '{collection}' cannot be tailed"
                )));
            }
            TailState {
                store: self.clone(),
                name: collection.to_string(),
                epoch: target.epoch,
                cursor: target.next_seq - 1,
                changes: target.changes.subscribe(),
                done: false,
            }
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                state.changes.borrow_and_update();
                match state.store.poll_after(&state.name, state.epoch, state.cursor) {
                    Ok(Some((seq, record))) => {
                        state.cursor = seq;
                        return Some((Ok(record), state));
                    }
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

    async fn snapshot(&self, collection: &str) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.records.iter().map(|s| s.record.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        Ok(inner.collections.get(collection).map(|c| c.info(collection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn person(id: &str) -> Record {
        Record::from_value(json!({"id": id, "name": format!("Person{id}"), "job": "Developer"})).unwrap()
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.key().to_string()).collect()
    }

    #[tokio::test]
    async fn test_keeps_most_recent_max_count_records() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024 * 1024, 3))
            .await
            .unwrap();

        for i in 1..=5 {
            store.insert("persons", person(&format!("p{i}"))).await.unwrap();
        }

        let kept = store.snapshot("persons").await.unwrap();
        assert_eq!(ids(&kept), vec!["p3", "p4", "p5"]);
    }

    #[tokio::test]
    async fn test_evicts_on_byte_capacity() {
        let store = MemoryStore::new();
        let size = person("p1").size_bytes().unwrap() as u64;
        store
            .ensure_bounded(&BoundedSpec::new("persons", size * 2, 100))
            .await
            .unwrap();

        for i in 1..=4 {
            store.insert("persons", person(&format!("p{i}"))).await.unwrap();
        }

        let info = store.describe("persons").await.unwrap().unwrap();
        assert!(info.bytes <= size * 2);
        assert_eq!(ids(&store.snapshot("persons").await.unwrap()), vec!["p3", "p4"]);
    }

    #[tokio::test]
    async fn test_rejects_record_larger_than_capacity() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 8, 10))
            .await
            .unwrap();

        let err = store.insert("persons", person("p1")).await.unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { capacity: 8, .. }));
    }

    #[tokio::test]
    async fn test_assigns_id_on_insert() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024, 10))
            .await
            .unwrap();

        let stored = store
            .insert("persons", Record::from_value(json!({"name": "Ada"})).unwrap())
            .await
            .unwrap();
        assert!(stored.id.is_some());
    }

    #[tokio::test]
    async fn test_rejects_id_already_retained() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024 * 1024, 2))
            .await
            .unwrap();

        store.insert("persons", person("p1")).await.unwrap();
        let err = store.insert("persons", person("p1")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "p1"));
        assert_eq!(ids(&store.snapshot("persons").await.unwrap()), vec!["p1"]);

        // Once evicted the id is free again
        store.insert("persons", person("p2")).await.unwrap();
        store.insert("persons", person("p3")).await.unwrap();
        store.insert("persons", person("p1")).await.unwrap();
        assert_eq!(ids(&store.snapshot("persons").await.unwrap()), vec!["p3", "p1"]);
    }

    #[tokio::test]
    async fn test_rejects_empty_id() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024, 10))
            .await
            .unwrap();

        let err = store.insert("persons", person("")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRecord(_)));
        assert_eq!(store.describe("persons").await.unwrap().unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_ensure_bounded_is_idempotent() {
        let store = MemoryStore::new();
        let spec = BoundedSpec::new("persons", 10 * 1024 * 1024, 1000);

        assert_eq!(store.ensure_bounded(&spec).await.unwrap(), EnsureOutcome::Created);
        store.insert("persons", person("p1")).await.unwrap();
        let once = store.describe("persons").await.unwrap();

        assert_eq!(
            store.ensure_bounded(&spec).await.unwrap(),
            EnsureOutcome::AlreadyBounded
        );
        assert_eq!(store.describe("persons").await.unwrap(), once);
    }

    #[tokio::test]
    async fn test_recreates_unbounded_collection() {
        let store = MemoryStore::new();
        store.create_unbounded("persons");
        assert!(matches!(
            store.insert("persons", person("old")).await,
            Err(Error::NotBounded(_))
        ));

        let spec = BoundedSpec::new("persons", 1024, 10);
        assert_eq!(store.ensure_bounded(&spec).await.unwrap(), EnsureOutcome::Recreated);

        let info = store.describe("persons").await.unwrap().unwrap();
        assert!(info.is_bounded_as(&spec));
        assert_eq!(info.count, 0);
    }

    #[tokio::test]
    async fn test_tail_starts_from_now_in_order() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024 * 1024, 100))
            .await
            .unwrap();
        store.insert("persons", person("before")).await.unwrap();

        let mut tail = store.tail("persons").await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            for i in 1..=3 {
                writer.insert("persons", person(&format!("p{i}"))).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let record = tokio::time::timeout(Duration::from_secs(2), tail.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push(record);
        }
        assert_eq!(ids(&seen), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_invalidated_cursor_errors_then_ends() {
        let store = MemoryStore::new();
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024, 10))
            .await
            .unwrap();
        let mut tail = store.tail("persons").await.unwrap();

        store.invalidate_cursors("persons");

        let item = tokio::time::timeout(Duration::from_secs(1), tail.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Err(Error::CursorInvalidated(_))));
        assert!(tail.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store
            .ensure_bounded(&BoundedSpec::new("persons", 1024, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unbounded_collection_cannot_be_tailed() {
        let store = MemoryStore::new();
        store.create_unbounded("persons");
        assert!(matches!(
            store.tail("persons").await,
            Err(Error::NotBounded(_))
        ));
    }
}
