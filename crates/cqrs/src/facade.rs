//! The engine's composition root.
//!
//! A [`Cqrs`] instance owns everything an execution needs: the aggregate
//! state registry, both executor registries, the snapshot cache, and the
//! decorated store (notifying over cache-invalidating over whatever base
//! store the builder was given). Registries live on the instance, so
//! multiple independent engines can coexist in one process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use common::{AggregateId, CommandId, Issuer};
use event_store::{AggregateEventStore, EventListener, LockingMode, NotifyingEventStore};

use crate::aggregate::{Aggregate, AggregateRegistry, AggregateState};
use crate::cache::{AggregateCache, CacheInvalidatingEventStore, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_MAX_AGE};
use crate::command::{CommandEnvelope, CommandExecutor, CommandExecutorRegistry};
use crate::context::ExecutionContext;
use crate::error::{CqrsError, Result};
use crate::event::{EventExecutor, EventExecutorRegistry};

/// The public entry point of the engine.
pub struct Cqrs {
    store: Arc<dyn AggregateEventStore>,
    notifier: Arc<NotifyingEventStore>,
    cache: Arc<AggregateCache>,
    event_executors: Arc<EventExecutorRegistry>,
    command_executors: Arc<CommandExecutorRegistry>,
    aggregates: Arc<AggregateRegistry>,
    locking: LockingMode,
}

impl std::fmt::Debug for Cqrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cqrs")
            .field("locking", &self.locking)
            .finish_non_exhaustive()
    }
}

impl Cqrs {
    /// Starts building an engine instance.
    pub fn builder() -> CqrsBuilder {
        CqrsBuilder::default()
    }

    pub fn locking(&self) -> LockingMode {
        self.locking
    }

    /// The decorated store the engine commits through.
    pub fn store(&self) -> Arc<dyn AggregateEventStore> {
        Arc::clone(&self.store)
    }

    /// Subscribes to the stream of durably committed events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<event_store::EventEnvelope> {
        self.notifier.subscribe()
    }

    /// Registers a listener invoked after every successful commit.
    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.notifier.add_listener(listener).await;
    }

    /// Creates a unit of work pre-wired with this engine's registries.
    pub fn new_execution_context(&self) -> ExecutionContext {
        ExecutionContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.event_executors),
            Arc::clone(&self.command_executors),
            Arc::clone(&self.aggregates),
            self.locking,
        )
    }

    /// Executes the given commands in one unit of work and returns its
    /// context; inspect it for the error or the per-command results.
    pub async fn execute_command(
        &self,
        commands: impl IntoIterator<Item = CommandEnvelope>,
    ) -> ExecutionContext {
        let mut context = self.new_execution_context();
        if let Err(e) = context.execute_command(commands).await {
            tracing::debug!(error = %e, "execution context failed");
        }
        context
    }

    /// Reads an aggregate's current state, cache-first.
    ///
    /// A miss rebuilds the aggregate from its event log and populates the
    /// cache. `Ok(None)` when the aggregate has no events.
    pub async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<Aggregate>> {
        if let Some(aggregate) = self.cache.get(aggregate_id) {
            return Ok(Some(aggregate));
        }
        let mut events = self.store.get_events_of(aggregate_id).await?;
        if events.is_empty() {
            return Ok(None);
        }
        let aggregate = Aggregate::apply_events(
            &mut events,
            &self.event_executors,
            &self.aggregates,
            self.locking,
        )?;
        self.cache.put(aggregate.clone());
        Ok(Some(aggregate))
    }

    /// Builds a typed command envelope from a raw payload.
    ///
    /// The payload must carry an `aggregateId`; `commandId` and
    /// `commandTimestamp` are honored when present. Unregistered type tags
    /// are rejected before the envelope exists.
    pub fn deserialise_command(
        &self,
        payload: serde_json::Value,
        type_tag: &str,
        issuer: Arc<dyn Issuer>,
    ) -> Result<CommandEnvelope> {
        let aggregate_id = payload
            .get("aggregateId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(AggregateId::from_uuid)
            .ok_or_else(|| {
                CqrsError::validation("command payload is missing a valid aggregateId")
            })?;

        let mut command = CommandEnvelope::new(type_tag, aggregate_id, issuer, payload);
        self.command_executors.resolve(&command)?;

        if let Some(id) = command
            .payload
            .get("commandId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            command = command.with_command_id(CommandId::from_uuid(id));
        }
        if let Some(at) = command
            .payload
            .get("commandTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            command.command_timestamp = at.with_timezone(&Utc);
        }
        Ok(command)
    }
}

/// Builder assembling a [`Cqrs`] instance.
///
/// `build` is where the one-time configuration validation happens: every
/// event executor's ordering capability must match the engine's locking
/// mode. A mismatch is fatal here, not a per-request failure later.
pub struct CqrsBuilder {
    base_store: Option<Arc<dyn AggregateEventStore>>,
    event_executors: EventExecutorRegistry,
    command_executors: CommandExecutorRegistry,
    aggregates: AggregateRegistry,
    locking: LockingMode,
    cache_capacity: usize,
    cache_max_age: Duration,
}

impl Default for CqrsBuilder {
    fn default() -> Self {
        Self {
            base_store: None,
            event_executors: EventExecutorRegistry::new(),
            command_executors: CommandExecutorRegistry::new(),
            aggregates: AggregateRegistry::new(),
            locking: LockingMode::Optimistic,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
        }
    }
}

impl CqrsBuilder {
    /// Sets the base event store. Required.
    pub fn store(mut self, store: Arc<dyn AggregateEventStore>) -> Self {
        self.base_store = Some(store);
        self
    }

    /// Sets the locking mode. Defaults to optimistic.
    pub fn locking(mut self, locking: LockingMode) -> Self {
        self.locking = locking;
        self
    }

    /// Bounds the aggregate cache by entry count.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Bounds the aggregate cache by entry age.
    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// Registers an event executor under its type tag.
    pub fn event_executor(mut self, executor: impl EventExecutor + 'static) -> Self {
        self.event_executors.register(Arc::new(executor));
        self
    }

    /// Registers an event executor resolved by predicate scan.
    pub fn event_executor_fallback(mut self, executor: impl EventExecutor + 'static) -> Self {
        self.event_executors.register_fallback(Arc::new(executor));
        self
    }

    /// Registers a command executor under its type tag.
    pub fn command_executor(mut self, executor: impl CommandExecutor + 'static) -> Self {
        self.command_executors.register(Arc::new(executor));
        self
    }

    /// Registers a command executor resolved by predicate scan.
    pub fn command_executor_fallback(mut self, executor: impl CommandExecutor + 'static) -> Self {
        self.command_executors.register_fallback(Arc::new(executor));
        self
    }

    /// Registers the state constructed for an aggregate type.
    pub fn aggregate_state<S>(mut self, aggregate_type: impl Into<String>) -> Self
    where
        S: AggregateState + Default,
    {
        self.aggregates.register_state::<S>(aggregate_type);
        self
    }

    /// Registers a custom state factory for an aggregate type.
    pub fn aggregate_factory(
        mut self,
        aggregate_type: impl Into<String>,
        factory: impl Fn() -> Box<dyn AggregateState> + Send + Sync + 'static,
    ) -> Self {
        self.aggregates.register(aggregate_type, factory);
        self
    }

    /// Validates the configuration and assembles the engine.
    pub fn build(self) -> Result<Cqrs> {
        let base_store = self.base_store.ok_or_else(|| {
            CqrsError::Configuration("an aggregate event store is required".to_string())
        })?;

        for executor in self.event_executors.iter() {
            if executor.is_transient() {
                if executor.ordering_required() {
                    return Err(CqrsError::Configuration(format!(
                        "transient event executor {} must not require ordering",
                        executor.type_tag()
                    )));
                }
                continue;
            }
            if executor.ordering_required() != self.locking.is_optimistic() {
                return Err(CqrsError::Configuration(format!(
                    "event executor {} does not match the configured locking mode {:?}",
                    executor.type_tag(),
                    self.locking
                )));
            }
        }

        let cache = Arc::new(AggregateCache::new(self.cache_capacity, self.cache_max_age));
        let invalidating = Arc::new(CacheInvalidatingEventStore::new(
            base_store,
            Arc::clone(&cache),
        ));
        let notifier = Arc::new(NotifyingEventStore::new(invalidating));
        let store: Arc<dyn AggregateEventStore> = notifier.clone();

        Ok(Cqrs {
            store,
            notifier,
            cache,
            event_executors: Arc::new(self.event_executors),
            command_executors: Arc::new(self.command_executors),
            aggregates: Arc::new(self.aggregates),
            locking: self.locking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::{EventEnvelope, InMemoryAggregateEventStore};

    struct Ordered;

    impl EventExecutor for Ordered {
        fn type_tag(&self) -> &str {
            "Ordered"
        }
        fn apply(&self, _event: &EventEnvelope, _aggregate: &mut Aggregate) -> Result<()> {
            Ok(())
        }
    }

    struct Unordered;

    impl EventExecutor for Unordered {
        fn type_tag(&self) -> &str {
            "Unordered"
        }
        fn ordering_required(&self) -> bool {
            false
        }
        fn apply(&self, _event: &EventEnvelope, _aggregate: &mut Aggregate) -> Result<()> {
            Ok(())
        }
    }

    fn base_store() -> Arc<dyn AggregateEventStore> {
        Arc::new(InMemoryAggregateEventStore::new())
    }

    #[test]
    fn build_requires_a_store() {
        let err = Cqrs::builder().build().unwrap_err();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }

    #[test]
    fn build_accepts_matching_locking_mode() {
        let cqrs = Cqrs::builder()
            .store(base_store())
            .event_executor(Ordered)
            .build();
        assert!(cqrs.is_ok());
    }

    #[test]
    fn build_rejects_no_lock_executor_under_optimistic_locking() {
        let err = Cqrs::builder()
            .store(base_store())
            .event_executor(Unordered)
            .build()
            .unwrap_err();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }

    #[test]
    fn build_rejects_lock_aware_executor_without_locking() {
        let err = Cqrs::builder()
            .store(base_store())
            .locking(LockingMode::Off)
            .event_executor(Ordered)
            .build()
            .unwrap_err();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }

    #[test]
    fn build_rejects_mixed_executor_capabilities() {
        let err = Cqrs::builder()
            .store(base_store())
            .event_executor(Ordered)
            .event_executor(Unordered)
            .build()
            .unwrap_err();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }
}
