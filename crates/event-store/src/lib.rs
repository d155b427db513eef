pub mod envelope;
pub mod error;
pub mod memory;
pub mod notify;
pub mod postgres;
pub mod store;

pub use common::{AggregateId, CommandId, EventId};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder};
pub use error::{Result, StoreError};
pub use memory::InMemoryAggregateEventStore;
pub use notify::{EventListener, NotifyingEventStore};
pub use postgres::PostgresAggregateEventStore;
pub use store::{AggregateEventStore, LockingMode};
