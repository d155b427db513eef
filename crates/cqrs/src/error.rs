//! Engine error taxonomy.

use common::{AggregateId, EventId};
use event_store::StoreError;
use thiserror::Error;

/// Errors produced by the command execution engine.
///
/// The taxonomy distinguishes caller-visible rejections (validation,
/// authorization, lock violations) from internal faults, which are wrapped
/// with a cause chain and never leaked raw to the boundary. `Clone` is
/// required so an error can be recorded on its `ExecutionContext` and
/// returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum CqrsError {
    /// No registered event executor matches the payload. A configuration
    /// fault, not a runtime condition.
    #[error("unknown event type: {0}. There's no EventExecutor registered for it")]
    UnknownEventType(String),

    /// No registered command executor matches the payload.
    #[error("unknown command type: {0}. There's no CommandExecutor registered for it")]
    UnknownCommandType(String),

    /// An event's ordinal skips ahead of the aggregate's sequence.
    /// Indicates log corruption or a misbehaving producer.
    #[error(
        "non-consecutive ordinal {ordinal} for event {event_id}: expected {expected}"
    )]
    NonConsecutiveOrdinal {
        event_id: EventId,
        ordinal: i64,
        expected: i64,
    },

    /// An event's ordinal was already applied. Duplicate delivery or a
    /// replayed application.
    #[error(
        "stale ordinal {ordinal} for event {event_id}: aggregate is already at {max_event_ordinal}"
    )]
    StaleOrdinal {
        event_id: EventId,
        ordinal: i64,
        max_event_ordinal: i64,
    },

    /// A business-rule rejection raised by `validate`.
    #[error("validation failed ({code}): {message}")]
    Validation { code: u16, message: String },

    /// An authorization rejection raised by `validate_auth`.
    #[error("authorization failed ({code}): {message}")]
    Authorization { code: u16, message: String },

    /// The first event of an aggregate's log is not aggregate-creating.
    #[error("the first event of aggregate {0} is not aggregate-creating")]
    FirstEventNotCreating(AggregateId),

    /// A non-creating aggregate command was executed without an aggregate.
    #[error("command {command_type} targeting aggregate {aggregate_id} must have a valid aggregate")]
    MissingAggregate {
        command_type: String,
        aggregate_id: AggregateId,
    },

    /// The execution context is terminal; no further actions are permitted.
    #[error("ExecutionContext is already committed. Can't perform additional actions")]
    AlreadyCommitted,

    /// `commit` was re-entered while draining the command queue.
    #[error("ExecutionContext is already committing. Don't call commit directly, just add commands")]
    AlreadyCommitting,

    /// Replay was handed an empty event sequence.
    #[error("cannot replay an empty event sequence")]
    EmptyEventSequence,

    /// Engine composition is invalid; raised once at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Store failure, including the expected [`StoreError::LockViolation`].
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A command failed for a reason the caller should not see directly.
    #[error("there was an error executing command {command_type}")]
    CommandFailed {
        command_type: String,
        #[source]
        source: Box<CqrsError>,
    },

    /// Flushing staged events to the store failed for an unexpected reason.
    #[error("there was an error saving events")]
    CommitFailed {
        #[source]
        source: Box<CqrsError>,
    },
}

impl CqrsError {
    /// Convenience constructor for validation rejections (default code 400).
    pub fn validation(message: impl Into<String>) -> Self {
        CqrsError::Validation {
            code: 400,
            message: message.into(),
        }
    }

    /// Convenience constructor for authorization rejections (default code 403).
    pub fn authorization(message: impl Into<String>) -> Self {
        CqrsError::Authorization {
            code: 403,
            message: message.into(),
        }
    }

    /// True when this error is meant for the caller as-is: business-rule
    /// rejections and concurrency conflicts. Everything else gets wrapped
    /// generically before crossing the boundary.
    pub fn returns_to_caller(&self) -> bool {
        match self {
            CqrsError::Validation { .. }
            | CqrsError::Authorization { .. }
            | CqrsError::MissingAggregate { .. } => true,
            CqrsError::Store(e) => e.is_lock_violation(),
            _ => false,
        }
    }

    /// A status-like code boundary layers can map onto their protocol.
    pub fn status_code(&self) -> u16 {
        match self {
            CqrsError::Validation { code, .. } | CqrsError::Authorization { code, .. } => *code,
            CqrsError::Store(e) if e.is_lock_violation() => 409,
            CqrsError::MissingAggregate { .. } => 400,
            _ => 500,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, CqrsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_authorization_return_to_caller() {
        assert!(CqrsError::validation("no title").returns_to_caller());
        assert!(CqrsError::authorization("not the creator").returns_to_caller());
    }

    #[test]
    fn lock_violation_returns_to_caller() {
        let e = CqrsError::Store(StoreError::LockViolation {
            aggregate_id: AggregateId::new(),
            ordinal: Some(5),
            source: None,
        });
        assert!(e.returns_to_caller());
        assert_eq!(e.status_code(), 409);
    }

    #[test]
    fn internal_errors_do_not_return_to_caller() {
        let e = CqrsError::UnknownCommandType("Nope".to_string());
        assert!(!e.returns_to_caller());

        let wrapped = CqrsError::CommandFailed {
            command_type: "CreateTodo".to_string(),
            source: Box::new(e),
        };
        assert!(!wrapped.returns_to_caller());
        assert_eq!(wrapped.status_code(), 500);
    }

    #[test]
    fn wrapped_errors_keep_their_cause() {
        use std::error::Error as _;

        let wrapped = CqrsError::CommandFailed {
            command_type: "CreateTodo".to_string(),
            source: Box::new(CqrsError::validation("no title")),
        };
        let cause = wrapped.source().expect("cause must be preserved");
        assert!(cause.to_string().contains("no title"));
    }
}
