//! Event executor dispatch.
//!
//! Behavior for an event payload is resolved from a registry owned by the
//! engine instance, never from global state. Primary dispatch is a map
//! lookup on the envelope's explicit `type_tag`; a predicate scan over
//! fallback executors exists for legacy/ambiguous payload shapes, and its
//! hits are memoized so repeated lookups stay O(1).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use common::AggregateId;
use event_store::EventEnvelope;

use crate::aggregate::Aggregate;
use crate::error::{CqrsError, Result};

/// The behavior resolved for an event payload: how to mutate an aggregate
/// with it, and the event's relationship to its aggregate.
///
/// Ordering capability is a flag, not a separate hierarchy: executors whose
/// events carry no ordinal return `ordering_required() == false`, and the
/// engine validates the flag against the configured locking mode once at
/// startup. The two kinds are never mixed in one engine.
pub trait EventExecutor: Send + Sync {
    /// The discriminant this executor handles.
    fn type_tag(&self) -> &str;

    /// Whether this executor can handle the given envelope. The default
    /// matches on `type_tag`; fallback executors may inspect the payload.
    fn can_execute(&self, event: &EventEnvelope) -> bool {
        event.type_tag == self.type_tag()
    }

    /// Mutates the aggregate with the event. Must be deterministic.
    fn apply(&self, event: &EventEnvelope, aggregate: &mut Aggregate) -> Result<()>;

    /// The aggregate the event belongs to.
    fn aggregate_id(&self, event: &EventEnvelope) -> AggregateId {
        event.aggregate_id
    }

    /// True when this event starts an aggregate's log.
    fn is_aggregate_creating(&self) -> bool {
        false
    }

    /// The type of aggregate a creating event produces.
    fn aggregate_type(&self) -> Option<&str> {
        None
    }

    /// Whether this executor's events participate in ordinal bookkeeping.
    fn ordering_required(&self) -> bool {
        true
    }

    /// Transient events are folded into in-memory state but never flushed
    /// to the durable store.
    fn is_transient(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn EventExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventExecutor")
            .field("type_tag", &self.type_tag())
            .finish_non_exhaustive()
    }
}

/// Registry of event executors, keyed by type tag.
#[derive(Default)]
pub struct EventExecutorRegistry {
    by_tag: HashMap<String, Arc<dyn EventExecutor>>,
    fallbacks: Vec<Arc<dyn EventExecutor>>,
    memoized: RwLock<HashMap<String, Arc<dyn EventExecutor>>>,
}

impl EventExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor under its type tag.
    pub fn register(&mut self, executor: Arc<dyn EventExecutor>) {
        self.by_tag.insert(executor.type_tag().to_string(), executor);
    }

    /// Registers an executor resolved by predicate scan instead of tag
    /// lookup. Reserved for payload shapes that predate explicit tags.
    pub fn register_fallback(&mut self, executor: Arc<dyn EventExecutor>) {
        self.fallbacks.push(executor);
    }

    /// Resolves the executor for an envelope.
    pub fn resolve(&self, event: &EventEnvelope) -> Result<Arc<dyn EventExecutor>> {
        if let Some(executor) = self.by_tag.get(&event.type_tag) {
            return Ok(Arc::clone(executor));
        }
        if let Some(executor) = self.memoized.read().get(&event.type_tag) {
            return Ok(Arc::clone(executor));
        }
        for executor in &self.fallbacks {
            if executor.can_execute(event) {
                tracing::debug!(
                    type_tag = %event.type_tag,
                    "resolved event executor via fallback scan"
                );
                self.memoized
                    .write()
                    .insert(event.type_tag.clone(), Arc::clone(executor));
                return Ok(Arc::clone(executor));
            }
        }
        Err(CqrsError::UnknownEventType(event.type_tag.clone()))
    }

    /// Whether any executor would handle the envelope.
    pub fn can_resolve(&self, event: &EventEnvelope) -> bool {
        self.resolve(event).is_ok()
    }

    /// All registered executors, tag-registered first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EventExecutor>> {
        self.by_tag.values().chain(self.fallbacks.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.fallbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged;

    impl EventExecutor for Tagged {
        fn type_tag(&self) -> &str {
            "Tagged"
        }
        fn apply(&self, _event: &EventEnvelope, _aggregate: &mut Aggregate) -> Result<()> {
            Ok(())
        }
    }

    struct LegacyShape;

    impl EventExecutor for LegacyShape {
        fn type_tag(&self) -> &str {
            "Legacy"
        }
        fn can_execute(&self, event: &EventEnvelope) -> bool {
            event.payload.get("legacy_marker").is_some()
        }
        fn apply(&self, _event: &EventEnvelope, _aggregate: &mut Aggregate) -> Result<()> {
            Ok(())
        }
    }

    fn envelope(type_tag: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(AggregateId::new())
            .type_tag(type_tag)
            .payload_raw(payload)
            .build()
    }

    #[test]
    fn resolves_by_tag() {
        let mut registry = EventExecutorRegistry::new();
        registry.register(Arc::new(Tagged));

        let executor = registry.resolve(&envelope("Tagged", serde_json::json!({}))).unwrap();
        assert_eq!(executor.type_tag(), "Tagged");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = EventExecutorRegistry::new();
        let err = registry
            .resolve(&envelope("Nope", serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, CqrsError::UnknownEventType(tag) if tag == "Nope"));
    }

    #[test]
    fn fallback_scan_matches_on_payload_shape() {
        let mut registry = EventExecutorRegistry::new();
        registry.register_fallback(Arc::new(LegacyShape));

        let event = envelope("SomeOldName", serde_json::json!({"legacy_marker": true}));
        let executor = registry.resolve(&event).unwrap();
        assert_eq!(executor.type_tag(), "Legacy");

        // Second lookup for the same tag comes from the memo, not the scan.
        assert!(registry.memoized.read().contains_key("SomeOldName"));
        assert!(registry.resolve(&event).is_ok());
    }

    #[test]
    fn tag_registration_wins_over_fallback() {
        let mut registry = EventExecutorRegistry::new();
        registry.register(Arc::new(Tagged));
        registry.register_fallback(Arc::new(LegacyShape));

        let event = envelope("Tagged", serde_json::json!({"legacy_marker": true}));
        let executor = registry.resolve(&event).unwrap();
        assert_eq!(executor.type_tag(), "Tagged");
    }
}
