//! Event-sourcing command execution engine.
//!
//! Aggregates are rebuilt by folding an ordered log of immutable events;
//! commands run against them under ordinal-based optimistic concurrency and
//! persist their events atomically through an [`ExecutionContext`].
//!
//! The [`Cqrs`] facade is the composition root: it owns the executor and
//! aggregate registries, decorates the store with cache invalidation and
//! commit notification, and hands out pre-wired execution contexts.

pub mod aggregate;
pub mod cache;
pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod facade;

pub use aggregate::{Aggregate, AggregateRegistry, AggregateState, BaseState};
pub use cache::{AggregateCache, CacheInvalidatingEventStore};
pub use command::{
    CommandEnvelope, CommandExecutor, CommandExecutorRegistry, CommandResult, execute_command_on,
};
pub use common::{AggregateId, Auth, CommandId, EventId, Issuer};
pub use context::{ExecutionContext, Status};
pub use error::{CqrsError, Result};
pub use event::{EventExecutor, EventExecutorRegistry};
pub use event_store::{
    AggregateEventStore, EventEnvelope, EventListener, InMemoryAggregateEventStore, LockingMode,
    NotifyingEventStore, PostgresAggregateEventStore, StoreError,
};
pub use facade::{Cqrs, CqrsBuilder};
