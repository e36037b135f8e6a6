use std::sync::Arc;
use tracing::{debug, error, info, warn};

use capstream_core::store::{BoundedSpec, BoundedStore, EnsureOutcome};
use capstream_core::Result;

/// Makes sure the backing collection is bounded before anything reads it
pub struct BoundedStoreManager {
    store: Arc<dyn BoundedStore>,
}

impl BoundedStoreManager {
    #[must_use]
    pub fn new(store: Arc<dyn BoundedStore>) -> Self {
        Self { store }
    }

    /// Create or fix up the collection. Safe to call repeatedly; an error
    /// here means the pipeline must not start.
    pub async fn ensure(&self, spec: &BoundedSpec) -> Result<EnsureOutcome> {
        let outcome = self.store.ensure_bounded(spec).await.map_err(|e| {
            error!(
                collection = %spec.name,
                error = %e,
                "Failed to ensure bounded collection"
            );
            e
        })?;

        match outcome {
            EnsureOutcome::Created => info!(
                collection = %spec.name,
                capacity_bytes = spec.capacity_bytes,
                max_count = spec.max_count,
                "Created bounded collection"
            ),
            EnsureOutcome::AlreadyBounded => debug!(
                collection = %spec.name,
                "Collection already bounded"
            ),
            EnsureOutcome::Recreated => warn!(
                collection = %spec.name,
                capacity_bytes = spec.capacity_bytes,
                max_count = spec.max_count,
                "Collection was not bounded as required; dropped and recreated, previous records are lost"
            ),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstream_core::store::MemoryStore;
    use capstream_core::Error;

    fn spec() -> BoundedSpec {
        BoundedSpec::new("persons", 10 * 1024 * 1024, 1000)
    }

    #[tokio::test]
    async fn test_ensure_twice_is_noop() {
        let store = MemoryStore::new();
        let manager = BoundedStoreManager::new(Arc::new(store.clone()));

        assert_eq!(manager.ensure(&spec()).await.unwrap(), EnsureOutcome::Created);
        let first = store.describe("persons").await.unwrap();
        assert_eq!(
            manager.ensure(&spec()).await.unwrap(),
            EnsureOutcome::AlreadyBounded
        );
        assert_eq!(store.describe("persons").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_plain_collection_is_recreated() {
        let store = MemoryStore::new();
        store.create_unbounded("persons");
        let manager = BoundedStoreManager::new(Arc::new(store.clone()));

        assert_eq!(manager.ensure(&spec()).await.unwrap(), EnsureOutcome::Recreated);
        let info = store.describe("persons").await.unwrap().unwrap();
        assert!(info.is_bounded_as(&spec()));
    }

    #[tokio::test]
    async fn test_different_limits_are_recreated() {
        let store = MemoryStore::new();
        let manager = BoundedStoreManager::new(Arc::new(store.clone()));
        manager
            .ensure(&BoundedSpec::new("persons", 1024, 10))
            .await
            .unwrap();

        assert_eq!(manager.ensure(&spec()).await.unwrap(), EnsureOutcome::Recreated);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal() {
        let store = MemoryStore::new();
        store.set_available(false);
        let manager = BoundedStoreManager::new(Arc::new(store));

        let err = manager.ensure(&spec()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }
}
