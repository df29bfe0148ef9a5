//! Failure taxonomy.
//!
//! Processors fail in exactly three ways, and everything the scheduler does
//! with a failed task follows from which one it was:
//! - `RateLimit`: retry at the exact reset time, budget untouched
//! - `Unrecoverable`: never retry, keep the task for audit
//! - `Transient`: retry until the configured cap, then freeze for audit

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure classification a processor reports for one attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The upstream told us when to come back.
    #[error("rate limited until {reset_at}: {message}")]
    RateLimit {
        reset_at: DateTime<Utc>,
        message: String,
    },

    /// The work can never succeed (resource gone, access revoked).
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Anything else; consumes one unit of retry budget.
    #[error("{0}")]
    Transient(String),
}

impl TaskError {
    pub fn rate_limit(reset_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::RateLimit {
            reset_at,
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transient(format!("json: {err}"))
    }
}

/// Persistence failures. The store being openable is a precondition for
/// running; mid-run commit failures are logged by the scheduler and the
/// affected task simply retries on the next scan.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
