//! Task records: the unit of durable, retryable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::ids::TaskId;

/// Task type tag, resolved against the processor registry at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind tag on a recorded failure. The retry cap counts transient records
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Unrecoverable,
}

/// One recorded failure: structured and bounded, not a stack trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A task as persisted in the `tasks` namespace.
///
/// Owned by the store: processors receive it read-only and never write it
/// back themselves. The scheduler deletes it (success) or rewrites it
/// (failure) when the attempt settles, atomically with the attempt's side
/// effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: Value,
    /// Earliest next attempt; set by rate-limited failures only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FailureRecord>,
    /// Terminal flag: excluded from scheduling, kept for audit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unrecoverable: bool,
}

impl TaskRecord {
    pub fn new(id: TaskId, task_type: TaskType, payload: Value) -> Self {
        Self {
            id,
            task_type,
            payload,
            retry_at: None,
            errors: Vec::new(),
            unrecoverable: false,
        }
    }

    /// Store key under the `tasks` namespace.
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Transient failures recorded so far; this is what the retry cap
    /// compares against.
    pub fn transient_failures(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind == FailureKind::Transient)
            .count()
    }

    /// Rewrite for a rate-limited attempt: defer, error list untouched.
    pub fn deferred(mut self, reset_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(reset_at);
        self
    }

    /// Rewrite for a transient failure: record it, clear any deferral.
    pub fn with_failure(mut self, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.retry_at = None;
        self.errors.push(FailureRecord {
            kind: FailureKind::Transient,
            message: message.into(),
            at,
        });
        self
    }

    /// Rewrite for an unrecoverable failure: flag terminal, keep for audit.
    pub fn poisoned(mut self, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.retry_at = None;
        self.unrecoverable = true;
        self.errors.push(FailureRecord {
            kind: FailureKind::Unrecoverable,
            message: message.into(),
            at,
        });
        self
    }
}
