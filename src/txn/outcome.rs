//! Outcome taxonomy and classification.
//!
//! Classification is pure and only feeds reporting; nothing in the
//! executor branches on it.

use crate::engine::{DbError, SqlState};
use crate::pool::PoolError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Failure of one task, tagged with the stage it failed in.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TaskError {
    #[error("task {task}: checkout failed: {source}")]
    Checkout {
        task: usize,
        #[source]
        source: PoolError,
    },

    #[error("task {task}: begin failed: {source}")]
    Begin {
        task: usize,
        #[source]
        source: DbError,
    },

    /// A policy directive was rejected; the transaction was rolled back.
    #[error("task {task}: applying `{directive}` failed: {source}")]
    Policy {
        task: usize,
        directive: String,
        #[source]
        source: DbError,
    },

    /// The body failed; the transaction was rolled back, never committed.
    #[error("task {task}: {error:#}")]
    Body { task: usize, error: anyhow::Error },

    #[error("task {task}: commit failed: {source}")]
    Commit {
        task: usize,
        #[source]
        source: DbError,
    },
}

impl TaskError {
    pub fn task(&self) -> usize {
        match self {
            Self::Checkout { task, .. }
            | Self::Begin { task, .. }
            | Self::Policy { task, .. }
            | Self::Body { task, .. }
            | Self::Commit { task, .. } => *task,
        }
    }

    /// The engine report behind the failure, if there is one.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Checkout {
                source: PoolError::Connect(err),
                ..
            }
            | Self::Begin { source: err, .. }
            | Self::Policy { source: err, .. }
            | Self::Commit { source: err, .. } => Some(err),
            Self::Checkout { .. } => None,
            Self::Body { error, .. } => error.chain().find_map(|e| e.downcast_ref::<DbError>()),
        }
    }
}

/// Classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Success,
    LockTimeout,
    StatementTimeout,
    IdleTimeout,
    CommitError,
    PolicyApplication,
    CheckoutTimeout,
    ConnectionFailed,
    Unknown,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::LockTimeout => "lock-timeout",
            Self::StatementTimeout => "statement-timeout",
            Self::IdleTimeout => "idle-timeout",
            Self::CommitError => "commit-error",
            Self::PolicyApplication => "policy-application",
            Self::CheckoutTimeout => "checkout-timeout",
            Self::ConnectionFailed => "connection-failed",
            Self::Unknown => "unknown",
        }
    }

    /// Kind of a timeout report, by SQLSTATE.
    pub fn from_timeout(err: &DbError) -> Option<Self> {
        match err.code {
            SqlState::LockNotAvailable => Some(Self::LockTimeout),
            SqlState::QueryCanceled => Some(Self::StatementTimeout),
            SqlState::IdleInTransactionSessionTimeout => Some(Self::IdleTimeout),
            _ => None,
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            Self::LockTimeout | Self::StatementTimeout | Self::IdleTimeout
        )
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a task failure to the outcome taxonomy.
pub fn classify(err: &TaskError) -> OutcomeKind {
    match err {
        TaskError::Checkout {
            source: PoolError::CheckoutTimeout { .. },
            ..
        } => OutcomeKind::CheckoutTimeout,
        TaskError::Checkout { .. } => OutcomeKind::ConnectionFailed,
        TaskError::Begin { source, .. } => {
            OutcomeKind::from_timeout(source).unwrap_or(OutcomeKind::ConnectionFailed)
        },
        TaskError::Policy { .. } => OutcomeKind::PolicyApplication,
        TaskError::Commit { source, .. } => match source.code {
            SqlState::IdleInTransactionSessionTimeout => OutcomeKind::IdleTimeout,
            _ => OutcomeKind::CommitError,
        },
        TaskError::Body { .. } => err
            .db_error()
            .and_then(OutcomeKind::from_timeout)
            .unwrap_or(OutcomeKind::Unknown),
    }
}

/// Coarse result of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskResult {
    /// Committed.
    Success,
    /// Rolled back after an engine-enforced timeout in the body.
    TimeoutError,
    /// `COMMIT` failed, including FATAL termination while idle.
    CommitError,
    /// Any other failure: checkout, policy application, or a body error
    /// that was not a timeout.
    Failed,
}

/// Immutable record of one task.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub task_index: usize,
    pub result: TaskResult,
    pub kind: OutcomeKind,
    /// Empty on success.
    pub message: String,
    /// Backend id of the connection the task ran on, if it got one.
    pub connection_id: Option<u64>,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(task_index: usize, connection_id: Option<u64>, elapsed: Duration) -> Self {
        Self {
            task_index,
            result: TaskResult::Success,
            kind: OutcomeKind::Success,
            message: String::new(),
            connection_id,
            elapsed_ms: millis(elapsed),
        }
    }

    pub fn failure(err: &TaskError, connection_id: Option<u64>, elapsed: Duration) -> Self {
        let kind = classify(err);
        let result = match err {
            TaskError::Commit { .. } => TaskResult::CommitError,
            TaskError::Body { .. } if kind.is_timeout() => TaskResult::TimeoutError,
            _ => TaskResult::Failed,
        };
        Self {
            task_index: err.task(),
            result,
            kind,
            message: err.to_string(),
            connection_id,
            elapsed_ms: millis(elapsed),
        }
    }

    /// Outcome of a task that panicked or was otherwise lost.
    pub fn lost(task_index: usize, message: impl Into<String>) -> Self {
        Self {
            task_index,
            result: TaskResult::Failed,
            kind: OutcomeKind::Unknown,
            message: message.into(),
            connection_id: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == TaskResult::Success
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
