use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{AggregateId, CommandId, EventId};

/// An event record: the immutable fact plus the metadata needed to store,
/// order and dispatch it.
///
/// The payload travels as JSON; `type_tag` is the explicit discriminant the
/// dispatch layer resolves behavior from. Whether an envelope creates its
/// aggregate is a property of the executor registered for its tag, not of
/// the envelope itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The command that issued this event, when known.
    pub issuer_command_id: Option<CommandId>,

    /// Discriminant used to resolve the event's executor.
    pub type_tag: String,

    /// When the event was emitted.
    pub created_time: DateTime<Utc>,

    /// When the event became durable. `None` until the store commits it.
    pub committed_time: Option<DateTime<Utc>>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Per-aggregate sequence number used for optimistic concurrency.
    /// `None` for freshly staged events until replay assigns one, and
    /// always `None` for stores that run without locking.
    pub ordinal: Option<i64>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the ordinal that must follow this event, when it has one.
    pub fn next_ordinal(&self) -> Option<i64> {
        self.ordinal.map(|o| o + 1)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    aggregate_id: Option<AggregateId>,
    issuer_command_id: Option<CommandId>,
    type_tag: Option<String>,
    created_time: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    ordinal: Option<i64>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID is generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the id of the command that issued this event.
    pub fn issuer_command_id(mut self, id: CommandId) -> Self {
        self.issuer_command_id = Some(id);
        self
    }

    /// Sets the type tag.
    pub fn type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    /// Sets the creation timestamp. If not set, the current time is used.
    pub fn created_time(mut self, at: DateTime<Utc>) -> Self {
        self.created_time = Some(at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the ordinal. Usually left unset; replay assigns it.
    pub fn ordinal(mut self, ordinal: i64) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if `aggregate_id`, `type_tag` or `payload` are not set.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            issuer_command_id: self.issuer_command_id,
            type_tag: self.type_tag.expect("type_tag is required"),
            created_time: self.created_time.unwrap_or_else(Utc::now),
            committed_time: None,
            payload: self.payload.expect("payload is required"),
            ordinal: self.ordinal,
        }
    }
}
