//! Aggregate snapshot cache and its invalidation decorator.
//!
//! The cache keeps fully folded aggregates so repeated facade reads skip
//! replay. It is bounded by entry count (LRU) and entry age, and it is only
//! ever *invalidated* on commit — the next read rebuilds from the log. This
//! is write-through invalidation, not a write-through cache; a reader racing
//! a writer can briefly repopulate a stale entry, which the next commit for
//! that aggregate evicts again.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use common::AggregateId;
use event_store::{AggregateEventStore, EventEnvelope, StoreError};

use crate::aggregate::Aggregate;

/// Default maximum number of cached aggregates.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default maximum age of a cached aggregate.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

struct CacheEntry {
    aggregate: Aggregate,
    cached_at: Instant,
}

/// Size- and age-bounded LRU cache of folded aggregates.
pub struct AggregateCache {
    inner: Mutex<LruCache<AggregateId, CacheEntry>>,
    max_age: Duration,
}

impl AggregateCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(size)),
            max_age,
        }
    }

    /// Returns a clone of the cached aggregate, dropping expired entries.
    pub fn get(&self, aggregate_id: AggregateId) -> Option<Aggregate> {
        let mut guard = self.inner.lock();
        match guard.get(&aggregate_id) {
            Some(entry) if entry.cached_at.elapsed() <= self.max_age => {
                Some(entry.aggregate.clone())
            }
            Some(_) => {
                guard.pop(&aggregate_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, aggregate: Aggregate) {
        let mut guard = self.inner.lock();
        guard.put(
            aggregate.aggregate_id(),
            CacheEntry {
                aggregate,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, aggregate_id: AggregateId) {
        self.inner.lock().pop(&aggregate_id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for AggregateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_MAX_AGE)
    }
}

/// Store decorator that evicts cached snapshots of every aggregate touched
/// by a successful commit.
pub struct CacheInvalidatingEventStore {
    inner: Arc<dyn AggregateEventStore>,
    cache: Arc<AggregateCache>,
}

impl CacheInvalidatingEventStore {
    pub fn new(inner: Arc<dyn AggregateEventStore>, cache: Arc<AggregateCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl AggregateEventStore for CacheInvalidatingEventStore {
    async fn get_events_of(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        self.inner.get_events_of(aggregate_id).await
    }

    async fn commit_event(&self, event: EventEnvelope) -> Result<(), StoreError> {
        let aggregate_id = event.aggregate_id;
        self.inner.commit_event(event).await?;
        self.cache.invalidate(aggregate_id);
        Ok(())
    }

    async fn commit_all_events(&self, events: Vec<EventEnvelope>) -> Result<(), StoreError> {
        let mut touched: Vec<AggregateId> = events.iter().map(|e| e.aggregate_id).collect();
        touched.dedup();
        self.inner.commit_all_events(events).await?;
        for aggregate_id in touched {
            self.cache.invalidate(aggregate_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateRegistry;
    use event_store::{InMemoryAggregateEventStore, LockingMode};

    fn aggregate(id: AggregateId) -> Aggregate {
        AggregateRegistry::new().instantiate("Todo", id, LockingMode::Optimistic)
    }

    fn event(aggregate_id: AggregateId, ordinal: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .type_tag("TodoCreated")
            .payload_raw(serde_json::json!({}))
            .ordinal(ordinal)
            .build()
    }

    #[test]
    fn get_returns_cached_aggregate() {
        let cache = AggregateCache::default();
        let id = AggregateId::new();
        cache.put(aggregate(id));

        let cached = cache.get(id).expect("entry should be cached");
        assert_eq!(cached.aggregate_id(), id);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = AggregateCache::new(10, Duration::ZERO);
        let id = AggregateId::new();
        cache.put(aggregate(id));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = AggregateCache::new(2, DEFAULT_CACHE_MAX_AGE);
        let first = AggregateId::new();
        let second = AggregateId::new();
        let third = AggregateId::new();

        cache.put(aggregate(first));
        cache.put(aggregate(second));
        cache.put(aggregate(third));

        assert!(cache.get(first).is_none());
        assert!(cache.get(second).is_some());
        assert!(cache.get(third).is_some());
    }

    #[tokio::test]
    async fn commit_invalidates_touched_aggregates_only() {
        let cache = Arc::new(AggregateCache::default());
        let store = CacheInvalidatingEventStore::new(
            Arc::new(InMemoryAggregateEventStore::new()),
            cache.clone(),
        );

        let touched = AggregateId::new();
        let untouched = AggregateId::new();
        cache.put(aggregate(touched));
        cache.put(aggregate(untouched));

        store.commit_event(event(touched, 1)).await.unwrap();

        assert!(cache.get(touched).is_none());
        assert!(cache.get(untouched).is_some());
    }

    #[tokio::test]
    async fn failed_commit_leaves_cache_alone() {
        let cache = Arc::new(AggregateCache::default());
        let inner = Arc::new(InMemoryAggregateEventStore::new());
        let store = CacheInvalidatingEventStore::new(inner.clone(), cache.clone());

        let id = AggregateId::new();
        inner.commit_event(event(id, 1)).await.unwrap();
        cache.put(aggregate(id));

        let result = store.commit_event(event(id, 1)).await;
        assert!(result.is_err());
        assert!(cache.get(id).is_some());
    }
}
