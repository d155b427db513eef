//! The per-unit-of-work orchestrator.
//!
//! An [`ExecutionContext`] queues commands, stages the events they produce,
//! and commits everything as one atomic batch. Nothing reaches the durable
//! store until the whole queue has executed successfully, yet commands later
//! in the queue observe the staged effects of earlier ones: `get_aggregate`
//! folds durable events together with the context's own staged events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use common::{AggregateId, CommandId};
use event_store::{AggregateEventStore, EventEnvelope, LockingMode};

use crate::aggregate::{Aggregate, AggregateRegistry};
use crate::command::{
    CommandEnvelope, CommandExecutorRegistry, CommandResult, execute_command_on,
};
use crate::error::{CqrsError, Result};
use crate::event::EventExecutorRegistry;

/// Lifecycle of an execution context. Transitions only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotCommitted,
    Committing,
    Committed,
}

/// A single-use transactional unit of work.
///
/// Created per logical operation, discarded after commit. Once the status
/// reaches [`Status::Committed`] — successfully or not — every further
/// mutating call fails.
pub struct ExecutionContext {
    status: Status,
    store: Arc<dyn AggregateEventStore>,
    event_executors: Arc<EventExecutorRegistry>,
    command_executors: Arc<CommandExecutorRegistry>,
    aggregates: Arc<AggregateRegistry>,
    locking: LockingMode,
    commands_to_execute: VecDeque<CommandEnvelope>,
    events_to_emit: Vec<EventEnvelope>,
    command_results: HashMap<CommandId, CommandResult>,
    durable_events_cache: HashMap<AggregateId, Vec<EventEnvelope>>,
    error: Option<CqrsError>,
}

impl ExecutionContext {
    /// Constructs a context wired with the engine's registries and store.
    pub fn new(
        store: Arc<dyn AggregateEventStore>,
        event_executors: Arc<EventExecutorRegistry>,
        command_executors: Arc<CommandExecutorRegistry>,
        aggregates: Arc<AggregateRegistry>,
        locking: LockingMode,
    ) -> Self {
        Self {
            status: Status::NotCommitted,
            store,
            event_executors,
            command_executors,
            aggregates,
            locking,
            commands_to_execute: VecDeque::new(),
            events_to_emit: Vec::new(),
            command_results: HashMap::new(),
            durable_events_cache: HashMap::new(),
            error: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The error this context failed with, if any.
    pub fn error(&self) -> Option<&CqrsError> {
        self.error.as_ref()
    }

    /// The events staged so far in this unit of work.
    pub fn staged_events(&self) -> &[EventEnvelope] {
        &self.events_to_emit
    }

    /// Fails once the context has reached its terminal status.
    fn validate_not_committed(&self) -> Result<()> {
        if self.status == Status::Committed {
            return Err(CqrsError::AlreadyCommitted);
        }
        Ok(())
    }

    fn record(&mut self, error: CqrsError) -> CqrsError {
        self.error = Some(error.clone());
        error
    }

    /// Adds a command to the execution queue.
    ///
    /// Rejects commands nothing can handle before any I/O happens.
    pub fn add_command_to_execute(&mut self, command: CommandEnvelope) -> Result<()> {
        self.validate_not_committed()?;
        self.command_executors.resolve(&command)?;
        self.commands_to_execute.push_back(command);
        Ok(())
    }

    /// Stages an event in this context. Nothing touches durable storage
    /// until the whole command queue has executed successfully.
    pub fn commit_event(&mut self, event: EventEnvelope) -> Result<()> {
        self.validate_not_committed()?;
        self.events_to_emit.push(event);
        Ok(())
    }

    /// Per-command result, created on demand. Executors use this to attach
    /// replies and record created aggregates.
    pub fn command_result_mut(&mut self, command: &CommandEnvelope) -> &mut CommandResult {
        self.command_results
            .entry(command.command_id)
            .or_insert_with(|| CommandResult::new(command))
    }

    pub fn has_command_result_for_command(&self, command: &CommandEnvelope) -> bool {
        self.command_results.contains_key(&command.command_id)
    }

    pub fn get_command_result_for_command(
        &self,
        command: &CommandEnvelope,
    ) -> Option<&CommandResult> {
        self.command_results.get(&command.command_id)
    }

    /// Durable events of an aggregate, fetched once per context.
    async fn durable_events_of(&mut self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        if !self.durable_events_cache.contains_key(&aggregate_id) {
            let events = self.store.get_events_of(aggregate_id).await?;
            self.durable_events_cache.insert(aggregate_id, events);
        }
        Ok(self.durable_events_cache[&aggregate_id].clone())
    }

    /// Indices into `events_to_emit` of events staged for an aggregate.
    fn staged_indices_of(&self, aggregate_id: AggregateId) -> Result<Vec<usize>> {
        let mut indices = Vec::new();
        for (i, event) in self.events_to_emit.iter().enumerate() {
            let executor = self.event_executors.resolve(event)?;
            if executor.aggregate_id(event) == aggregate_id {
                indices.push(i);
            }
        }
        Ok(indices)
    }

    /// Materializes an aggregate as this unit of work sees it: durable
    /// events first, then events staged earlier in this same context.
    ///
    /// Staged events without ordinals receive them during the fold, so the
    /// eventual flush writes the sequence this context observed.
    pub async fn get_aggregate(&mut self, aggregate_id: AggregateId) -> Result<Option<Aggregate>> {
        let mut durable = self.durable_events_of(aggregate_id).await?;
        let staged = self.staged_indices_of(aggregate_id)?;
        if durable.is_empty() && staged.is_empty() {
            return Ok(None);
        }

        let executors = Arc::clone(&self.event_executors);
        let mut aggregate = {
            let first = match durable.first() {
                Some(event) => event,
                None => &self.events_to_emit[staged[0]],
            };
            let executor = executors.resolve(first)?;
            if !executor.is_aggregate_creating() {
                return Err(CqrsError::FirstEventNotCreating(aggregate_id));
            }
            let aggregate_type = executor.aggregate_type().ok_or_else(|| {
                CqrsError::Configuration(format!(
                    "aggregate-creating executor for {} declares no aggregate type",
                    first.type_tag
                ))
            })?;
            self.aggregates
                .instantiate(aggregate_type, aggregate_id, self.locking)
        };

        for event in durable.iter_mut() {
            let executor = executors.resolve(event)?;
            Aggregate::apply_event_on_aggregate(event, executor.as_ref(), &mut aggregate)?;
        }
        for index in staged {
            let event = &mut self.events_to_emit[index];
            let executor = executors.resolve(event)?;
            Aggregate::apply_event_on_aggregate(event, executor.as_ref(), &mut aggregate)?;
        }
        Ok(Some(aggregate))
    }

    /// Convenience: queue the given commands and commit.
    pub async fn execute_command(
        &mut self,
        commands: impl IntoIterator<Item = CommandEnvelope>,
    ) -> Result<()> {
        self.validate_not_committed()?;
        for command in commands {
            if let Err(e) = self.add_command_to_execute(command) {
                return Err(self.record(e));
            }
        }
        self.commit().await
    }

    /// Drains the command queue in FIFO order, then flushes every staged
    /// event to the store as one atomic batch.
    ///
    /// The first failing command makes the context terminal: the error is
    /// recorded, the remaining queue is abandoned, and the store is never
    /// touched. Caller-visible errors pass through unchanged; anything else
    /// is wrapped with its cause.
    pub async fn commit(&mut self) -> Result<()> {
        self.validate_not_committed()?;
        if self.status == Status::Committing {
            return Err(CqrsError::AlreadyCommitting);
        }
        self.status = Status::Committing;

        while let Some(command) = self.commands_to_execute.pop_front() {
            if let Err(e) = self.execute_single(&command).await {
                self.status = Status::Committed;
                let error = if e.returns_to_caller() {
                    e
                } else {
                    CqrsError::CommandFailed {
                        command_type: command.type_tag.clone(),
                        source: Box::new(e),
                    }
                };
                tracing::debug!(
                    command_type = %command.type_tag,
                    command_id = %command.command_id,
                    error = %error,
                    "command failed, abandoning execution context"
                );
                return Err(self.record(error));
            }
        }

        // All commands executed correctly.
        self.status = Status::Committed;

        let staged = std::mem::take(&mut self.events_to_emit);
        let mut to_flush = Vec::with_capacity(staged.len());
        for event in staged {
            let executor = match self.event_executors.resolve(&event) {
                Ok(executor) => executor,
                Err(e) => {
                    let error = CqrsError::CommitFailed { source: Box::new(e) };
                    return Err(self.record(error));
                }
            };
            if !executor.is_transient() {
                to_flush.push(event);
            }
        }

        match self.store.commit_all_events(to_flush).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = CqrsError::from(e);
                let error = if error.returns_to_caller() {
                    error
                } else {
                    CqrsError::CommitFailed {
                        source: Box::new(error),
                    }
                };
                Err(self.record(error))
            }
        }
    }

    async fn execute_single(&mut self, command: &CommandEnvelope) -> Result<()> {
        let executor = self.command_executors.resolve(command)?;

        let mut aggregate = if executor.is_aggregate_creating() {
            let aggregate_type = executor.new_aggregate_type().ok_or_else(|| {
                CqrsError::Configuration(format!(
                    "aggregate-creating executor for {} declares no aggregate type",
                    command.type_tag
                ))
            })?;
            Some(
                self.aggregates
                    .instantiate(aggregate_type, command.aggregate_id, self.locking),
            )
        } else {
            self.get_aggregate(command.aggregate_id).await?
        };

        let staged_before = self.events_to_emit.len();
        execute_command_on(executor.as_ref(), command, self, aggregate.as_ref()).await?;

        // Fold this command's events into the in-memory aggregate so later
        // commands in the queue observe them (and ordinals get assigned).
        if let Some(aggregate) = aggregate.as_mut() {
            let executors = Arc::clone(&self.event_executors);
            for event in &mut self.events_to_emit[staged_before..] {
                let event_executor = executors.resolve(event)?;
                if event_executor.aggregate_id(event) == aggregate.aggregate_id() {
                    Aggregate::apply_event_on_aggregate(
                        event,
                        event_executor.as_ref(),
                        aggregate,
                    )?;
                }
            }
        }

        let result = self.command_result_mut(command);
        if executor.is_aggregate_creating() && !result.has_new_aggregate() {
            if let Some(aggregate_type) = executor.new_aggregate_type() {
                result.set_new_aggregate(aggregate_type, command.aggregate_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Auth;
    use event_store::InMemoryAggregateEventStore;

    fn empty_context() -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(InMemoryAggregateEventStore::new()),
            Arc::new(EventExecutorRegistry::new()),
            Arc::new(CommandExecutorRegistry::new()),
            Arc::new(AggregateRegistry::new()),
            LockingMode::Optimistic,
        )
    }

    fn command(type_tag: &str) -> CommandEnvelope {
        CommandEnvelope::new(
            type_tag,
            AggregateId::new(),
            Arc::new(Auth::new("user", "u1", vec![])),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn unknown_command_is_rejected_before_any_io() {
        let mut context = empty_context();
        let err = context.add_command_to_execute(command("Nope")).unwrap_err();
        assert!(matches!(err, CqrsError::UnknownCommandType(tag) if tag == "Nope"));
        assert_eq!(context.status(), Status::NotCommitted);
    }

    #[tokio::test]
    async fn empty_commit_succeeds_and_becomes_terminal() {
        let mut context = empty_context();
        context.commit().await.unwrap();
        assert_eq!(context.status(), Status::Committed);

        let err = context.commit().await.unwrap_err();
        assert!(matches!(err, CqrsError::AlreadyCommitted));
    }

    #[tokio::test]
    async fn committed_context_rejects_staging() {
        let mut context = empty_context();
        context.commit().await.unwrap();

        let event = EventEnvelope::builder()
            .aggregate_id(AggregateId::new())
            .type_tag("Whatever")
            .payload_raw(serde_json::json!({}))
            .build();
        let err = context.commit_event(event).unwrap_err();
        assert!(matches!(err, CqrsError::AlreadyCommitted));
    }

    #[tokio::test]
    async fn get_aggregate_of_unknown_id_is_none() {
        let mut context = empty_context();
        let aggregate = context.get_aggregate(AggregateId::new()).await.unwrap();
        assert!(aggregate.is_none());
    }
}
