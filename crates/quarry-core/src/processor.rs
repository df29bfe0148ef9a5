//! The processor contract: the unit of work the scheduler drives.
//!
//! Design:
//! - A processor never writes to the store directly. It returns mutations
//!   in [`ProcessOutput`]; the scheduler commits them atomically together
//!   with the task's own settlement. A crash therefore re-runs the whole
//!   task instead of resuming from a half-written effect.
//! - Failure intent travels via [`TaskError`]: rate limits defer, poison
//!   freezes, everything else retries.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::domain::{TaskError, TaskRecord};
use crate::store::{Mutation, Namespace};

/// Type-relative identity and payload for a task a processor wants created.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub key: String,
    pub payload: Value,
}

impl TaskDef {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// What a successful run hands back to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Propagated by [`get_or_create`] as the produced resource.
    pub value: Option<Value>,
    /// Committed atomically with the task's settlement.
    pub batch: Vec<Mutation>,
}

impl ProcessOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn batch(batch: Vec<Mutation>) -> Self {
        Self { value: None, batch }
    }

    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            batch: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// The task type this processor handles. Must be unique per registry.
    fn task_type(&self) -> &str;

    /// Derive key and payload from a source item, for the fan-out helpers
    /// on [`Context`]. Processors that are never fanned out keep the
    /// default.
    fn task_def(&self, _ctx: &Context, _item: &Value) -> Result<TaskDef, TaskError> {
        Err(TaskError::transient(format!(
            "task type '{}' cannot be created from items",
            self.task_type()
        )))
    }

    /// Last-moment veto before a fan-out task is enqueued.
    fn validate(&self, _ctx: &Context, _payload: &Value) -> bool {
        true
    }

    async fn process(&self, ctx: &Context, task: &TaskRecord) -> Result<ProcessOutput, TaskError>;
}

/// Idempotent produce: if `ns/key` already holds a value, return it without
/// running `create`; otherwise run `create` and prepend the put for the new
/// value to its batch, so the resource and its side effects commit together.
pub async fn get_or_create<F, Fut>(
    ctx: &Context,
    ns: &Namespace,
    key: &str,
    create: F,
) -> Result<ProcessOutput, TaskError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ProcessOutput, TaskError>>,
{
    if let Some(existing) = ctx.get(ns, key).await? {
        return Ok(ProcessOutput {
            value: Some(existing),
            batch: Vec::new(),
        });
    }

    let mut out = create().await?;
    let value = out.value.take().ok_or_else(|| {
        TaskError::transient(format!("create for '{ns}/{key}' produced no value"))
    })?;
    out.batch
        .insert(0, Mutation::put_value(ns.clone(), key, value.clone()));
    out.value = Some(value);
    Ok(out)
}
