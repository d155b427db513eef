//! Shared types for the CQRS engine: identifier newtypes and the issuer
//! identity/authorization value consumed by command authorization.

pub mod auth;
pub mod ids;

pub use auth::{Auth, Issuer};
pub use ids::{AggregateId, CommandId, EventId};
