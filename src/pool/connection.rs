//! Checked-out connections and transactions on them.

use super::{DriverConnection, PoolInner};
use crate::engine::{CommandTag, DbError, Execution, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

/// A connection checked out of the pool.
///
/// Owned by exactly one caller until dropped, at which point it returns to
/// the pool. A connection the engine terminated is marked broken and is
/// closed instead of returning to the idle set.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Box<dyn DriverConnection>>,
    id: u64,
    created: Instant,
    broken: bool,
    dirty: bool,
}

impl PooledConnection {
    pub(crate) fn new(pool: Arc<PoolInner>, conn: Box<dyn DriverConnection>, created: Instant) -> Self {
        Self {
            pool,
            id: conn.id(),
            conn: Some(conn),
            created,
            broken: false,
            dirty: false,
        }
    }

    /// Backend id of the underlying session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Executes one statement outside any explicit transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's report. A fatal report marks the connection
    /// broken.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::connection_closed());
        };
        self.dirty = true;
        let result = conn.execute(sql, params).await;
        if let Err(err) = &result
            && err.is_fatal()
        {
            self.broken = true;
        }
        result
    }

    /// Opens a transaction block.
    ///
    /// # Errors
    ///
    /// Returns the engine's report if `BEGIN` fails.
    pub async fn begin(&mut self) -> Result<Transaction<'_>, DbError> {
        self.execute("BEGIN", &[]).await?;
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }

    /// Prevents the connection from returning to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .release(conn, self.created, self.broken, self.dirty);
        }
    }
}

/// An open transaction block.
///
/// Must end with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it unfinished leaves the session mid-transaction, so the
/// connection is marked broken and closed on release.
pub struct Transaction<'c> {
    conn: &'c mut PooledConnection,
    finished: bool,
}

impl Transaction<'_> {
    /// Backend id of the connection the transaction runs on.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Executes one statement inside the block.
    ///
    /// # Errors
    ///
    /// Returns the engine's report. After an error the engine only accepts
    /// `ROLLBACK`.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        self.conn.execute(sql, params).await
    }

    /// Commits the block.
    ///
    /// # Errors
    ///
    /// Returns the engine's report if `COMMIT` fails, or `40000` if the
    /// engine ended the block with a rollback because it had been aborted.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        let execution = self.conn.execute("COMMIT", &[]).await?;
        self.finished = true;
        if execution.tag == CommandTag::Rollback {
            return Err(DbError::commit_rolled_back());
        }
        Ok(())
    }

    /// Rolls the block back.
    ///
    /// # Errors
    ///
    /// Returns the engine's report if `ROLLBACK` fails; the connection is
    /// then marked broken.
    pub async fn rollback(&mut self) -> Result<(), DbError> {
        self.finished = true;
        let result = self.conn.execute("ROLLBACK", &[]).await;
        if result.is_err() {
            self.conn.mark_broken();
        }
        result.map(|_| ())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(conn = self.conn.id(), "transaction dropped without commit or rollback");
            self.conn.mark_broken();
        }
    }
}
