//! Tests for the transaction executor.

use super::*;
use crate::constants::{SCHEMA, SEED, SELECT_ROW, UPDATE_ROW};
use crate::engine::{DbError, Engine, Execution, SqlState, Value};
use crate::pool::{ConnectionPool, Driver, DriverConnection, EngineDriver, PoolConfig, Transaction};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Engine, ConnectionPool) {
    let engine = Engine::in_memory().unwrap();
    let mut session = engine.connect("postgres").await.unwrap();
    session.execute(SCHEMA, &[]).await.unwrap();
    session.execute(SEED, &[]).await.unwrap();
    drop(session);
    let pool = ConnectionPool::new(
        EngineDriver::new(engine.clone(), "postgres"),
        PoolConfig::default(),
    );
    (engine, pool)
}

/// Writes the task index, then optionally idles inside the transaction.
struct WriteAndHold(Duration);

#[async_trait]
impl TaskBody for WriteAndHold {
    async fn run(&self, tx: &mut Transaction<'_>, task: usize) -> anyhow::Result<()> {
        tx.execute(UPDATE_ROW, &[Value::Integer(task as i64)])
            .await
            .context("update")?;
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl TaskBody for Failing {
    async fn run(&self, tx: &mut Transaction<'_>, task: usize) -> anyhow::Result<()> {
        tx.execute(UPDATE_ROW, &[Value::Integer(task as i64)]).await?;
        anyhow::bail!("body gave up")
    }
}

struct RefusingDriver;

#[async_trait]
impl Driver for RefusingDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DbError> {
        Err(DbError::fatal(
            SqlState::TooManyConnections,
            "sorry, too many clients already",
        ))
    }
}

async fn current(engine: &Engine) -> Option<i64> {
    let mut session = engine.connect("postgres").await.unwrap();
    session
        .execute(SELECT_ROW, &[])
        .await
        .unwrap()
        .scalar()
        .and_then(Value::as_i64)
}

// =============================================================================
// Executor
// =============================================================================

#[tokio::test]
async fn test_successful_task_commits() {
    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool.clone());

    let outcome = executor
        .execute(&TimeoutPolicy::named("none"), &WriteAndHold(Duration::ZERO), 3)
        .await;
    assert!(outcome.is_success());
    assert_eq!(outcome.task_index, 3);
    assert!(outcome.connection_id.is_some());
    assert_eq!(current(&engine).await, Some(3));
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_failed_body_rolls_back() {
    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool.clone());

    let outcome = executor
        .execute(&TimeoutPolicy::named("none"), &Failing, 1)
        .await;
    assert_eq!(outcome.result, TaskResult::Failed);
    assert_eq!(outcome.kind, OutcomeKind::Unknown);
    assert!(outcome.message.contains("body gave up"));
    assert_eq!(current(&engine).await, Some(777));
    assert!(!engine.is_row_locked("ian"));
    // A clean rollback leaves the connection reusable.
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_rejected_directive_is_policy_failure() {
    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool);
    // Above the engine's maximum for a timeout setting.
    let policy = TimeoutPolicy::named("huge").lock(Duration::from_secs(10_000_000));

    let outcome = executor
        .execute(&policy, &WriteAndHold(Duration::ZERO), 1)
        .await;
    assert_eq!(outcome.kind, OutcomeKind::PolicyApplication);
    assert!(outcome.message.contains("SET lock_timeout=10000000000"));
    assert_eq!(current(&engine).await, Some(777));
}

#[tokio::test]
async fn test_refused_connection() {
    let pool = ConnectionPool::new(RefusingDriver, PoolConfig::default());
    let executor = TransactionExecutor::new(pool.clone());

    let outcome = executor
        .execute(&TimeoutPolicy::named("none"), &WriteAndHold(Duration::ZERO), 1)
        .await;
    assert_eq!(outcome.kind, OutcomeKind::ConnectionFailed);
    assert_eq!(outcome.connection_id, None);
    assert_eq!(pool.stats().open, 0);
}

#[tokio::test(start_paused = true)]
async fn test_contended_update_one_winner() {
    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool);
    let policy = Arc::new(TimeoutPolicy::named("lock").lock(Duration::from_millis(1500)));
    let body = Arc::new(WriteAndHold(Duration::from_secs(3)));

    let tasks: Vec<_> = (1..=2)
        .map(|task| {
            let executor = executor.clone();
            let policy = Arc::clone(&policy);
            let body = Arc::clone(&body);
            tokio::spawn(async move { executor.execute(&policy, body.as_ref(), task).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }

    let winners: Vec<_> = outcomes.iter().filter(|o| o.is_success()).collect();
    let losers: Vec<_> = outcomes
        .iter()
        .filter(|o| o.kind == OutcomeKind::LockTimeout)
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);
    assert_eq!(losers[0].result, TaskResult::TimeoutError);
    assert_eq!(current(&engine).await, Some(winners[0].task_index as i64));
}

#[tokio::test(start_paused = true)]
async fn test_idle_in_transaction_fails_at_commit() {
    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool.clone());
    let policy = TimeoutPolicy::named("idle").idle_in_transaction(Duration::from_millis(1500));

    let outcome = executor
        .execute(&policy, &WriteAndHold(Duration::from_secs(3)), 1)
        .await;
    assert_eq!(outcome.result, TaskResult::CommitError);
    assert_eq!(outcome.kind, OutcomeKind::IdleTimeout);
    assert_eq!(current(&engine).await, Some(777));

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.broken_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_statement_timeout_never_commits() {
    struct Sleep;

    #[async_trait]
    impl TaskBody for Sleep {
        async fn run(&self, tx: &mut Transaction<'_>, _task: usize) -> anyhow::Result<()> {
            tx.execute("SELECT pg_sleep(3);", &[]).await?;
            tx.execute(UPDATE_ROW, &[Value::Integer(1)]).await?;
            Ok(())
        }
    }

    let (engine, pool) = setup().await;
    let executor = TransactionExecutor::new(pool);
    let policy = TimeoutPolicy::named("statement").statement(Duration::from_millis(1500));

    let outcome = executor.execute(&policy, &Sleep, 1).await;
    assert_eq!(outcome.kind, OutcomeKind::StatementTimeout);
    assert_eq!(outcome.result, TaskResult::TimeoutError);
    assert_eq!(current(&engine).await, Some(777));
}

// =============================================================================
// Commit failures
// =============================================================================

/// Driver whose connections fail every `COMMIT` with `error` and log what
/// they were sent.
struct CommitRejectingDriver {
    inner: EngineDriver,
    error: DbError,
    log: Arc<parking_lot::Mutex<Vec<String>>>,
}

struct CommitRejectingConnection {
    inner: Box<dyn DriverConnection>,
    error: DbError,
    log: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl Driver for CommitRejectingDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DbError> {
        Ok(Box::new(CommitRejectingConnection {
            inner: self.inner.connect().await?,
            error: self.error.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

#[async_trait]
impl DriverConnection for CommitRejectingConnection {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        self.log.lock().push(sql.to_string());
        if sql == "COMMIT" {
            return Err(self.error.clone());
        }
        self.inner.execute(sql, params).await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }
}

async fn run_with_rejected_commit(
    error: DbError,
) -> (Engine, ConnectionPool, ExecutionOutcome, Vec<String>) {
    let (engine, _) = setup().await;
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let pool = ConnectionPool::new(
        CommitRejectingDriver {
            inner: EngineDriver::new(engine.clone(), "postgres"),
            error,
            log: Arc::clone(&log),
        },
        PoolConfig::default(),
    );
    let outcome = TransactionExecutor::new(pool.clone())
        .execute(
            &TimeoutPolicy::named("commit"),
            &WriteAndHold(Duration::ZERO),
            1,
        )
        .await;
    let log = log.lock().clone();
    (engine, pool, outcome, log)
}

#[tokio::test]
async fn test_failed_commit_is_followed_by_rollback() {
    let (engine, pool, outcome, log) = run_with_rejected_commit(DbError::new(
        SqlState::UniqueViolation,
        "duplicate key value violates unique constraint",
    ))
    .await;

    assert_eq!(outcome.result, TaskResult::CommitError);
    assert_eq!(outcome.kind, OutcomeKind::CommitError);
    assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(&log[log.len() - 2..], ["COMMIT", "ROLLBACK"]);
    assert!(!engine.is_row_locked("ian"));
    assert_eq!(current(&engine).await, Some(777));

    // A non-fatal report leaves the session usable.
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.broken_closed, 0);
}

#[tokio::test]
async fn test_fatal_commit_discards_connection() {
    let (engine, pool, outcome, log) = run_with_rejected_commit(DbError::fatal(
        SqlState::ConnectionDoesNotExist,
        "server closed the connection unexpectedly",
    ))
    .await;

    assert_eq!(outcome.result, TaskResult::CommitError);
    assert_eq!(outcome.kind, OutcomeKind::CommitError);
    assert_eq!(&log[log.len() - 2..], ["COMMIT", "ROLLBACK"]);
    assert!(!engine.is_row_locked("ian"));

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.broken_closed, 1);
}
