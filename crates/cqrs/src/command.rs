//! Commands and command executor dispatch.
//!
//! A command is a request to change state. Its executor validates it,
//! checks the issuer's authorization, and finally stages the events the
//! change produces. The registry mirrors the event side: tag-map dispatch
//! owned by the engine instance, predicate fallback for legacy shapes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use async_trait::async_trait;
use common::{AggregateId, CommandId, Issuer};

use crate::aggregate::Aggregate;
use crate::context::ExecutionContext;
use crate::error::{CqrsError, Result};

/// A command plus the metadata needed to dispatch and audit it.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    /// Unique identifier for this command.
    pub command_id: CommandId,

    /// When the command was issued.
    pub command_timestamp: DateTime<Utc>,

    /// The identity issuing the command.
    pub issuer: Arc<dyn Issuer>,

    /// Discriminant used to resolve the command's executor.
    pub type_tag: String,

    /// The aggregate the command acts on (or will create).
    pub aggregate_id: AggregateId,

    /// The command payload as JSON.
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Creates a command with a generated id and the current timestamp.
    pub fn new(
        type_tag: impl Into<String>,
        aggregate_id: AggregateId,
        issuer: Arc<dyn Issuer>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: CommandId::new(),
            command_timestamp: Utc::now(),
            issuer,
            type_tag: type_tag.into(),
            aggregate_id,
            payload,
        }
    }

    /// Overrides the generated command id (e.g. when the caller supplies one
    /// for idempotency tracking).
    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }
}

/// Per-command outcome, inspectable on the execution context afterwards.
#[derive(Debug, Clone)]
pub struct CommandResult {
    command_id: CommandId,
    command_type: String,
    new_aggregate: Option<(String, AggregateId)>,
    sub_results: Vec<CommandResult>,
    reply: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn new(command: &CommandEnvelope) -> Self {
        Self {
            command_id: command.command_id,
            command_type: command.type_tag.clone(),
            new_aggregate: None,
            sub_results: Vec::new(),
            reply: None,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    /// Records the aggregate a creating command produced.
    pub fn set_new_aggregate(
        &mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
    ) {
        self.new_aggregate = Some((aggregate_type.into(), aggregate_id));
    }

    pub fn new_aggregate(&self) -> Option<&(String, AggregateId)> {
        self.new_aggregate.as_ref()
    }

    pub fn has_new_aggregate(&self) -> bool {
        self.new_aggregate.is_some()
    }

    /// Attaches the outcome of a sub-command spawned by this command.
    pub fn add_sub_result(&mut self, result: CommandResult) {
        self.sub_results.push(result);
    }

    pub fn sub_results(&self) -> &[CommandResult] {
        &self.sub_results
    }

    pub fn has_sub_results(&self) -> bool {
        !self.sub_results.is_empty()
    }

    /// Sets the payload returned to the caller.
    pub fn set_reply(&mut self, reply: serde_json::Value) {
        self.reply = Some(reply);
    }

    pub fn reply(&self) -> Option<&serde_json::Value> {
        self.reply.as_ref()
    }
}

/// The behavior resolved for a command payload.
///
/// `validate` rejects with [`CqrsError::Validation`], `validate_auth` with
/// [`CqrsError::Authorization`]; `do_execute` stages events through the
/// execution context. Use [`execute_command_on`] to run the full pipeline.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// The discriminant this executor handles.
    fn type_tag(&self) -> &str;

    /// Whether this executor can handle the given envelope.
    fn can_execute(&self, command: &CommandEnvelope) -> bool {
        command.type_tag == self.type_tag()
    }

    /// True when this command creates its aggregate and is therefore exempt
    /// from requiring a pre-existing one.
    fn is_aggregate_creating(&self) -> bool {
        false
    }

    /// The type of aggregate a creating command produces.
    fn new_aggregate_type(&self) -> Option<&str> {
        None
    }

    /// Business-rule validation, before any side effect.
    async fn validate(
        &self,
        command: &CommandEnvelope,
        context: &mut ExecutionContext,
        aggregate: Option<&Aggregate>,
    ) -> Result<()>;

    /// Authorization of the issuer against the target aggregate.
    async fn validate_auth(
        &self,
        command: &CommandEnvelope,
        context: &mut ExecutionContext,
        aggregate: Option<&Aggregate>,
    ) -> Result<()>;

    /// Executes the already validated command, staging events on the context.
    async fn do_execute(
        &self,
        command: &CommandEnvelope,
        context: &mut ExecutionContext,
        aggregate: Option<&Aggregate>,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("type_tag", &self.type_tag())
            .finish_non_exhaustive()
    }
}

/// Runs a command through the full pipeline: aggregate-presence check, then
/// `validate → validate_auth → do_execute`.
///
/// A non-creating command without an aggregate is rejected with a
/// caller-visible [`CqrsError::MissingAggregate`] before validation runs.
pub async fn execute_command_on(
    executor: &dyn CommandExecutor,
    command: &CommandEnvelope,
    context: &mut ExecutionContext,
    aggregate: Option<&Aggregate>,
) -> Result<()> {
    if aggregate.is_none() && !executor.is_aggregate_creating() {
        return Err(CqrsError::MissingAggregate {
            command_type: command.type_tag.clone(),
            aggregate_id: command.aggregate_id,
        });
    }
    executor.validate(command, context, aggregate).await?;
    executor.validate_auth(command, context, aggregate).await?;
    executor.do_execute(command, context, aggregate).await
}

/// Registry of command executors, keyed by type tag.
#[derive(Default)]
pub struct CommandExecutorRegistry {
    by_tag: HashMap<String, Arc<dyn CommandExecutor>>,
    fallbacks: Vec<Arc<dyn CommandExecutor>>,
    memoized: RwLock<HashMap<String, Arc<dyn CommandExecutor>>>,
}

impl CommandExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor under its type tag.
    pub fn register(&mut self, executor: Arc<dyn CommandExecutor>) {
        self.by_tag.insert(executor.type_tag().to_string(), executor);
    }

    /// Registers an executor resolved by predicate scan instead of tag lookup.
    pub fn register_fallback(&mut self, executor: Arc<dyn CommandExecutor>) {
        self.fallbacks.push(executor);
    }

    /// Resolves the executor for a command envelope.
    pub fn resolve(&self, command: &CommandEnvelope) -> Result<Arc<dyn CommandExecutor>> {
        if let Some(executor) = self.by_tag.get(&command.type_tag) {
            return Ok(Arc::clone(executor));
        }
        if let Some(executor) = self.memoized.read().get(&command.type_tag) {
            return Ok(Arc::clone(executor));
        }
        for executor in &self.fallbacks {
            if executor.can_execute(command) {
                self.memoized
                    .write()
                    .insert(command.type_tag.clone(), Arc::clone(executor));
                return Ok(Arc::clone(executor));
            }
        }
        Err(CqrsError::UnknownCommandType(command.type_tag.clone()))
    }

    /// Whether the tag alone is registered (used by command intake).
    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.by_tag.contains_key(type_tag) || self.memoized.read().contains_key(type_tag)
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.fallbacks.is_empty()
    }
}
