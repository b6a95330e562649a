//! Runs one transaction from checkout to commit.

use super::outcome::{ExecutionOutcome, TaskError};
use super::policy::TimeoutPolicy;
use crate::pool::{ConnectionPool, Transaction};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Work done inside a task's transaction.
///
/// The body runs after the policy has been applied and before `COMMIT`.
/// Returning an error rolls the transaction back.
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Runs the body for task `task` (1-based).
    ///
    /// # Errors
    ///
    /// Any error aborts the task; engine reports should be kept in the
    /// error chain so the outcome can be classified.
    async fn run(&self, tx: &mut Transaction<'_>, task: usize) -> anyhow::Result<()>;
}

/// Drives a single task through checkout, `BEGIN`, policy, body and
/// `COMMIT`.
#[derive(Clone)]
pub struct TransactionExecutor {
    pool: ConnectionPool,
}

impl TransactionExecutor {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs task `task` and reports how it ended. Never fails; every error
    /// is folded into the outcome.
    pub async fn execute(
        &self,
        policy: &TimeoutPolicy,
        body: &dyn TaskBody,
        task: usize,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let mut connection_id = None;
        match self.run(policy, body, task, &mut connection_id).await {
            Ok(()) => ExecutionOutcome::success(task, connection_id, started.elapsed()),
            Err(err) => ExecutionOutcome::failure(&err, connection_id, started.elapsed()),
        }
    }

    async fn run(
        &self,
        policy: &TimeoutPolicy,
        body: &dyn TaskBody,
        task: usize,
        connection_id: &mut Option<u64>,
    ) -> Result<(), TaskError> {
        let mut conn = self
            .pool
            .checkout()
            .await
            .map_err(|source| TaskError::Checkout { task, source })?;
        *connection_id = Some(conn.id());
        info!(task, conn = conn.id(), "start");

        let mut tx = conn
            .begin()
            .await
            .map_err(|source| TaskError::Begin { task, source })?;

        if let Err((directive, source)) = policy.apply(&mut tx).await {
            warn!(task, %directive, error = %source, "err");
            rollback_quietly(&mut tx, task).await;
            return Err(TaskError::Policy {
                task,
                directive,
                source,
            });
        }

        if let Err(error) = body.run(&mut tx, task).await {
            warn!(task, error = %format!("{error:#}"), "err");
            rollback_quietly(&mut tx, task).await;
            return Err(TaskError::Body { task, error });
        }

        if let Err(source) = tx.commit().await {
            warn!(task, error = %source, "commit failed");
            rollback_quietly(&mut tx, task).await;
            return Err(TaskError::Commit { task, source });
        }
        info!(task, "commit");
        Ok(())
    }
}

/// Rolls back after a failure. The rollback's own error is only logged:
/// after a FATAL report the session is already gone.
async fn rollback_quietly(tx: &mut Transaction<'_>, task: usize) {
    if let Err(err) = tx.rollback().await {
        debug!(task, error = %err, "rollback failed");
    }
}
