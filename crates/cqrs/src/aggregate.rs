//! Aggregates: replay-built projections of an event stream.
//!
//! An [`Aggregate`] owns three things: the domain state reconstructed by
//! folding events, the extra roles it grants to entities, and the ordinal
//! bookkeeping that backs optimistic locking. Concrete state shapes are
//! registered per aggregate type in an [`AggregateRegistry`]; unregistered
//! types fall back to [`BaseState`].

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use common::{AggregateId, EventId, Issuer};
use event_store::{EventEnvelope, LockingMode};

use crate::error::{CqrsError, Result};
use crate::event::{EventExecutor, EventExecutorRegistry};

/// Domain state carried by an aggregate.
///
/// Blanket-implemented for any clonable, debuggable, `'static` type, so
/// domain crates just define a plain struct and register it.
pub trait AggregateState: Any + Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn AggregateState>;
}

impl<T> AggregateState for T
where
    T: Any + Send + Sync + std::fmt::Debug + Clone,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn AggregateState> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn AggregateState> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Fallback state for aggregate types with no registered variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseState;

/// A materialized, identity-addressed projection of an event stream.
#[derive(Debug, Clone)]
pub struct Aggregate {
    aggregate_type: String,
    aggregate_id: AggregateId,
    roles: HashMap<String, BTreeSet<String>>,
    max_event_ordinal: i64,
    locking: LockingMode,
    state: Box<dyn AggregateState>,
}

impl Aggregate {
    /// Creates an empty aggregate. Prefer [`AggregateRegistry::instantiate`].
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        locking: LockingMode,
        state: Box<dyn AggregateState>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            roles: HashMap::new(),
            max_event_ordinal: 0,
            locking,
            state,
        }
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    /// The identity used for role lookups: `"type:id"`.
    pub fn full_id(&self) -> String {
        format!("{}:{}", self.aggregate_type, self.aggregate_id)
    }

    /// The ordinal of the last successfully applied event; 0 before any.
    pub fn max_event_ordinal(&self) -> i64 {
        self.max_event_ordinal
    }

    /// The ordinal the next applied event must carry.
    pub fn next_event_ordinal(&self) -> i64 {
        self.max_event_ordinal + 1
    }

    pub fn locking(&self) -> LockingMode {
        self.locking
    }

    /// Downcasts the domain state.
    pub fn state<S: AggregateState>(&self) -> Option<&S> {
        self.state.as_any().downcast_ref::<S>()
    }

    /// Downcasts the domain state mutably.
    pub fn state_mut<S: AggregateState>(&mut self) -> Option<&mut S> {
        self.state.as_any_mut().downcast_mut::<S>()
    }

    /// Validates that an event carrying `ordinal` may be applied now.
    ///
    /// An ordinal at or below the current max fails with [`CqrsError::StaleOrdinal`]
    /// — re-application is never silently absorbed, since that masks
    /// duplicate-delivery bugs. An ordinal beyond `max + 1` fails with
    /// [`CqrsError::NonConsecutiveOrdinal`].
    pub fn check_event_can_be_applied(&self, ordinal: i64, event_id: EventId) -> Result<()> {
        if ordinal <= self.max_event_ordinal {
            return Err(CqrsError::StaleOrdinal {
                event_id,
                ordinal,
                max_event_ordinal: self.max_event_ordinal,
            });
        }
        if ordinal > self.max_event_ordinal + 1 {
            return Err(CqrsError::NonConsecutiveOrdinal {
                event_id,
                ordinal,
                expected: self.max_event_ordinal + 1,
            });
        }
        Ok(())
    }

    fn advance_ordinal(&mut self, ordinal: i64) {
        if ordinal > self.max_event_ordinal {
            self.max_event_ordinal = ordinal;
        }
    }

    /// Grants extra roles to an entity on this aggregate.
    pub fn add_aggregate_role(&mut self, entity_id: impl Into<String>, roles: Vec<String>) {
        self.roles.entry(entity_id.into()).or_default().extend(roles);
    }

    /// Revokes roles from an entity. With `roles = None` the entity loses
    /// every role it held on this aggregate.
    pub fn remove_aggregate_role(&mut self, entity_id: &str, roles: Option<&[String]>) {
        match roles {
            None => {
                self.roles.remove(entity_id);
            }
            Some(roles) => {
                if let Some(granted) = self.roles.get_mut(entity_id) {
                    for role in roles {
                        granted.remove(role);
                    }
                    if granted.is_empty() {
                        self.roles.remove(entity_id);
                    }
                }
            }
        }
    }

    /// The extra roles this aggregate grants to an entity. Unknown entities
    /// get an empty list, never an error.
    pub fn aggregate_roles_for(&self, entity_id: &str) -> Vec<String> {
        self.roles
            .get(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Everything an issuer may do here: the issuer's own roles toward this
    /// aggregate plus the roles the aggregate grants the issuer.
    pub fn roles_of(&self, issuer: &dyn Issuer) -> Vec<String> {
        let mut all: BTreeSet<String> = issuer.roles(Some(&self.full_id())).into_iter().collect();
        all.extend(self.aggregate_roles_for(&issuer.full_id()));
        all.into_iter().collect()
    }

    /// Rebuilds an aggregate by folding an event sequence in order.
    ///
    /// The first event must resolve to an aggregate-creating executor;
    /// anything else is an integrity violation. Events staged without an
    /// ordinal receive the next one in place, which is why the slice is
    /// mutable.
    pub fn apply_events(
        events: &mut [EventEnvelope],
        executors: &EventExecutorRegistry,
        registry: &AggregateRegistry,
        locking: LockingMode,
    ) -> Result<Aggregate> {
        let first = events.first().ok_or(CqrsError::EmptyEventSequence)?;
        let executor = executors.resolve(first)?;
        if !executor.is_aggregate_creating() {
            return Err(CqrsError::FirstEventNotCreating(first.aggregate_id));
        }
        let aggregate_type = executor.aggregate_type().ok_or_else(|| {
            CqrsError::Configuration(format!(
                "aggregate-creating executor for {} declares no aggregate type",
                first.type_tag
            ))
        })?;
        let aggregate_id = executor.aggregate_id(first);
        let mut aggregate = registry.instantiate(aggregate_type, aggregate_id, locking);

        for event in events.iter_mut() {
            let executor = executors.resolve(event)?;
            Self::apply_event_on_aggregate(event, executor.as_ref(), &mut aggregate)?;
        }
        Ok(aggregate)
    }

    /// Applies one event to an aggregate, enforcing the ordinal discipline.
    pub fn apply_event_on_aggregate(
        event: &mut EventEnvelope,
        executor: &dyn EventExecutor,
        aggregate: &mut Aggregate,
    ) -> Result<()> {
        if aggregate.locking.is_optimistic() && executor.ordering_required() {
            match event.ordinal {
                Some(ordinal) => aggregate.check_event_can_be_applied(ordinal, event.event_id)?,
                None => event.ordinal = Some(aggregate.next_event_ordinal()),
            }
        }
        executor.apply(event, aggregate)?;
        if let Some(ordinal) = event.ordinal {
            aggregate.advance_ordinal(ordinal);
        }
        Ok(())
    }
}

type StateFactory = Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync>;

/// Factory registry mapping aggregate type names to state constructors.
///
/// Owned by the composition root; there is no ambient/global type table, so
/// several independent engines can coexist in one process.
#[derive(Clone, Default)]
pub struct AggregateRegistry {
    factories: HashMap<String, StateFactory>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a state constructor for an aggregate type.
    pub fn register(
        &mut self,
        aggregate_type: impl Into<String>,
        factory: impl Fn() -> Box<dyn AggregateState> + Send + Sync + 'static,
    ) {
        self.factories.insert(aggregate_type.into(), Arc::new(factory));
    }

    /// Registers `S::default()` as the state for an aggregate type.
    pub fn register_state<S>(&mut self, aggregate_type: impl Into<String>)
    where
        S: AggregateState + Default,
    {
        self.register(aggregate_type, || Box::new(S::default()));
    }

    /// Builds a fresh aggregate for `(aggregate_type, aggregate_id)`.
    ///
    /// Unregistered types get [`BaseState`]; every call produces an
    /// independent instance.
    pub fn instantiate(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        locking: LockingMode,
    ) -> Aggregate {
        let state = match self.factories.get(aggregate_type) {
            Some(factory) => factory(),
            None => Box::new(BaseState),
        };
        Aggregate::new(aggregate_type, aggregate_id, locking, state)
    }
}
