//! Todo fixture domain used by the engine integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cqrs::{
    Aggregate, AggregateEventStore, AggregateId, Auth, CommandEnvelope, CommandExecutor, Cqrs,
    CqrsError, EventEnvelope, EventExecutor, ExecutionContext, Issuer, Result,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TodoStatus {
    #[default]
    NotDone,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoState {
    pub title: String,
    pub description: String,
    pub status: TodoStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TodoCreatedPayload {
    pub title: String,
    pub description: String,
    pub creator: String,
}

pub struct TodoCreatedExecutor;

impl EventExecutor for TodoCreatedExecutor {
    fn type_tag(&self) -> &str {
        "TodoCreated"
    }

    fn is_aggregate_creating(&self) -> bool {
        true
    }

    fn aggregate_type(&self) -> Option<&str> {
        Some("Todo")
    }

    fn apply(&self, event: &EventEnvelope, aggregate: &mut Aggregate) -> Result<()> {
        let payload: TodoCreatedPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| CqrsError::validation(format!("malformed TodoCreated payload: {e}")))?;
        aggregate.add_aggregate_role(payload.creator.clone(), vec!["creator".to_string()]);
        let state = aggregate.state_mut::<TodoState>().expect("todo state");
        state.title = payload.title;
        state.description = payload.description;
        state.status = TodoStatus::NotDone;
        Ok(())
    }
}

pub struct TodoMarkedDoneExecutor;

impl EventExecutor for TodoMarkedDoneExecutor {
    fn type_tag(&self) -> &str {
        "TodoMarkedDone"
    }

    fn apply(&self, _event: &EventEnvelope, aggregate: &mut Aggregate) -> Result<()> {
        aggregate.state_mut::<TodoState>().expect("todo state").status = TodoStatus::Done;
        Ok(())
    }
}

/// Fire-and-forget marker event: folded in memory, never persisted.
pub struct TodoViewedExecutor;

impl EventExecutor for TodoViewedExecutor {
    fn type_tag(&self) -> &str {
        "TodoViewed"
    }

    fn ordering_required(&self) -> bool {
        false
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn apply(&self, _event: &EventEnvelope, _aggregate: &mut Aggregate) -> Result<()> {
        Ok(())
    }
}

pub struct CreateTodoExecutor;

#[async_trait]
impl CommandExecutor for CreateTodoExecutor {
    fn type_tag(&self) -> &str {
        "CreateTodo"
    }

    fn is_aggregate_creating(&self) -> bool {
        true
    }

    fn new_aggregate_type(&self) -> Option<&str> {
        Some("Todo")
    }

    async fn validate(
        &self,
        command: &CommandEnvelope,
        _context: &mut ExecutionContext,
        _aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        if command.payload.get("title").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
            return Err(CqrsError::validation("Need to specify a title for the Todo"));
        }
        if command
            .payload
            .get("description")
            .and_then(|v| v.as_str())
            .is_none_or(str::is_empty)
        {
            return Err(CqrsError::validation(
                "Need to specify a description for the Todo",
            ));
        }
        Ok(())
    }

    async fn validate_auth(
        &self,
        command: &CommandEnvelope,
        _context: &mut ExecutionContext,
        _aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        if !command.issuer.full_id().starts_with("user:") {
            return Err(CqrsError::authorization(
                "Only users can execute this command",
            ));
        }
        Ok(())
    }

    async fn do_execute(
        &self,
        command: &CommandEnvelope,
        context: &mut ExecutionContext,
        _aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        let payload = TodoCreatedPayload {
            title: command.payload["title"].as_str().unwrap_or_default().to_string(),
            description: command.payload["description"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            creator: command.issuer.full_id(),
        };
        let event = EventEnvelope::builder()
            .aggregate_id(command.aggregate_id)
            .issuer_command_id(command.command_id)
            .type_tag("TodoCreated")
            .payload(&payload)
            .map_err(|e| CqrsError::validation(e.to_string()))?
            .build();
        context.commit_event(event)
    }
}

pub struct MarkTodoDoneExecutor;

#[async_trait]
impl CommandExecutor for MarkTodoDoneExecutor {
    fn type_tag(&self) -> &str {
        "MarkTodoDone"
    }

    async fn validate(
        &self,
        _command: &CommandEnvelope,
        _context: &mut ExecutionContext,
        aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        let state = aggregate
            .and_then(|a| a.state::<TodoState>())
            .expect("todo state");
        if state.status != TodoStatus::NotDone {
            return Err(CqrsError::validation("Todo is not currently in NotDone"));
        }
        Ok(())
    }

    async fn validate_auth(
        &self,
        command: &CommandEnvelope,
        _context: &mut ExecutionContext,
        aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        let aggregate = aggregate.expect("aggregate present");
        let roles = aggregate.roles_of(command.issuer.as_ref());
        if !roles.iter().any(|r| r == "creator") {
            return Err(CqrsError::authorization(
                "Only the creator of the Todo can mark it as done",
            ));
        }
        Ok(())
    }

    async fn do_execute(
        &self,
        command: &CommandEnvelope,
        context: &mut ExecutionContext,
        _aggregate: Option<&Aggregate>,
    ) -> Result<()> {
        let event = EventEnvelope::builder()
            .aggregate_id(command.aggregate_id)
            .issuer_command_id(command.command_id)
            .type_tag("TodoMarkedDone")
            .payload_raw(serde_json::json!({}))
            .build();
        context.commit_event(event)
    }
}

/// Builds an engine wired with the Todo domain over the given base store.
pub fn build_engine(store: Arc<dyn AggregateEventStore>) -> Cqrs {
    Cqrs::builder()
        .store(store)
        .aggregate_state::<TodoState>("Todo")
        .event_executor(TodoCreatedExecutor)
        .event_executor(TodoMarkedDoneExecutor)
        .event_executor(TodoViewedExecutor)
        .command_executor(CreateTodoExecutor)
        .command_executor(MarkTodoDoneExecutor)
        .build()
        .expect("engine configuration is valid")
}

pub fn user(id: &str) -> Arc<dyn Issuer> {
    Arc::new(Auth::new("user", id, vec!["registered".to_string()]))
}

pub fn create_todo(
    aggregate_id: AggregateId,
    issuer: Arc<dyn Issuer>,
    title: &str,
    description: &str,
) -> CommandEnvelope {
    CommandEnvelope::new(
        "CreateTodo",
        aggregate_id,
        issuer,
        serde_json::json!({"title": title, "description": description}),
    )
}

pub fn mark_todo_done(aggregate_id: AggregateId, issuer: Arc<dyn Issuer>) -> CommandEnvelope {
    CommandEnvelope::new("MarkTodoDone", aggregate_id, issuer, serde_json::json!({}))
}

pub fn todo_viewed_event(aggregate_id: AggregateId) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id)
        .type_tag("TodoViewed")
        .payload_raw(serde_json::json!({}))
        .build()
}
