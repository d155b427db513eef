use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use common::AggregateId;

use crate::{
    EventEnvelope, Result, StoreError,
    store::{AggregateEventStore, LockingMode, validate_batch},
};

/// In-memory aggregate event store for testing.
///
/// Simulates the SQL store's `(aggregate_id, ordinal)` unique constraint so
/// concurrency tests can provoke [`StoreError::LockViolation`] without a
/// database. Batches are checked in full before anything is applied, keeping
/// the all-or-nothing contract.
#[derive(Clone, Default)]
pub struct InMemoryAggregateEventStore {
    events: Arc<RwLock<HashMap<AggregateId, Vec<EventEnvelope>>>>,
    locking: LockingMode,
}

impl InMemoryAggregateEventStore {
    /// Creates a new empty in-memory event store with optimistic locking.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store running under the given locking mode.
    pub fn with_locking(locking: LockingMode) -> Self {
        Self {
            events: Arc::default(),
            locking,
        }
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.values().map(Vec::len).sum()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    fn conflict(
        existing: &HashMap<AggregateId, Vec<EventEnvelope>>,
        event: &EventEnvelope,
    ) -> bool {
        let Some(ordinal) = event.ordinal else {
            return false;
        };
        existing
            .get(&event.aggregate_id)
            .is_some_and(|log| log.iter().any(|e| e.ordinal == Some(ordinal)))
    }
}

#[async_trait]
impl AggregateEventStore for InMemoryAggregateEventStore {
    async fn get_events_of(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let mut events = store.get(&aggregate_id).cloned().unwrap_or_default();
        match self.locking {
            LockingMode::Optimistic => {
                events.sort_by_key(|e| (e.ordinal.is_none(), e.ordinal, e.committed_time));
            }
            LockingMode::Off => events.sort_by_key(|e| e.committed_time),
        }
        Ok(events)
    }

    async fn commit_event(&self, event: EventEnvelope) -> Result<()> {
        self.commit_all_events(vec![event]).await
    }

    async fn commit_all_events(&self, events: Vec<EventEnvelope>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(&events)?;

        let mut store = self.events.write().await;

        // Reject the whole batch before applying any of it.
        for event in &events {
            if Self::conflict(&store, event) {
                return Err(StoreError::LockViolation {
                    aggregate_id: event.aggregate_id,
                    ordinal: event.ordinal,
                    source: None,
                });
            }
        }

        let committed_at = Utc::now();
        for mut event in events {
            event.committed_time = Some(committed_at);
            store.entry(event.aggregate_id).or_default().push(event);
        }
        Ok(())
    }
}
