use async_trait::async_trait;

use common::AggregateId;

use crate::{EventEnvelope, Result, StoreError};

/// Concurrency discipline a store (and the engine above it) runs under.
///
/// The mode is fixed at composition time; executors are validated against it
/// once at startup, never per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingMode {
    /// Ordinal-based optimistic locking. Events carry consecutive per-aggregate
    /// ordinals and the store's unique constraint arbitrates racing writers.
    #[default]
    Optimistic,
    /// No ordering enforcement; events are ordered by commit time only.
    Off,
}

impl LockingMode {
    /// True when ordinal bookkeeping is in effect.
    pub fn is_optimistic(&self) -> bool {
        matches!(self, LockingMode::Optimistic)
    }
}

/// Persistence contract for aggregate events.
///
/// Append-only. Implementations must be thread-safe; correctness under
/// concurrent writers is the store's job, via the `(aggregate_id, ordinal)`
/// uniqueness rule surfaced as [`StoreError::LockViolation`].
#[async_trait]
pub trait AggregateEventStore: Send + Sync {
    /// Loads all events of an aggregate, oldest first.
    ///
    /// Under [`LockingMode::Optimistic`] the order is ordinal then commit
    /// time; otherwise commit time only.
    async fn get_events_of(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>>;

    /// Appends a single event.
    async fn commit_event(&self, event: EventEnvelope) -> Result<()>;

    /// Appends a batch of events atomically: either every event in the batch
    /// becomes durable, or none does.
    async fn commit_all_events(&self, events: Vec<EventEnvelope>) -> Result<()>;
}

/// Rejects batches no store implementation should accept: duplicate
/// `(aggregate_id, ordinal)` pairs inside one batch would make the outcome
/// depend on insert order.
pub fn validate_batch(events: &[EventEnvelope]) -> Result<()> {
    for (i, event) in events.iter().enumerate() {
        let Some(ordinal) = event.ordinal else {
            continue;
        };
        let clash = events[..i]
            .iter()
            .any(|e| e.aggregate_id == event.aggregate_id && e.ordinal == Some(ordinal));
        if clash {
            return Err(StoreError::InvalidBatch(format!(
                "duplicate ordinal {ordinal} for aggregate {} within one batch",
                event.aggregate_id
            )));
        }
    }
    Ok(())
}
