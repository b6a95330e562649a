//! Concurrency harness and the context that owns the engine and the pool.
//!
//! [`ConcurrencyHarness::run_batch`] fans out `count` executor runs as
//! independent tokio tasks and joins all of them before returning.
//! [`HarnessContext`] is built once at startup; it bootstraps the schema,
//! resets the baseline row and serializes scenario runs.

use crate::config::Config;
use crate::constants::{SCHEMA, SEED, SELECT_ROW, count_sessions_sql};
use crate::engine::{Engine, Execution, ResourceStore, Value};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, EngineDriver, PoolConfig, PoolStats};
use crate::scenarios::{self, ScenarioKind, ScenarioReport};
use crate::txn::{ExecutionOutcome, OutcomeKind, TaskBody, TimeoutPolicy, TransactionExecutor};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

/// Result of one batch: one outcome per task, in task order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub policy: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcomes: Vec<ExecutionOutcome>,
    pub pool_before: PoolStats,
    pub pool_after: PoolStats,
}

impl BatchReport {
    /// Number of tasks that ended with `kind`.
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.kind == kind).count()
    }

    pub fn successes(&self) -> usize {
        self.count(OutcomeKind::Success)
    }

    /// Highest number of connections in use at once during the batch.
    pub fn peak_in_use(&self) -> usize {
        self.pool_after.peak_in_use
    }
}

/// Runs batches of concurrent transactions.
#[derive(Clone)]
pub struct ConcurrencyHarness {
    executor: TransactionExecutor,
}

impl ConcurrencyHarness {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            executor: TransactionExecutor::new(pool),
        }
    }

    /// Runs tasks `1..=count` concurrently and waits for all of them.
    ///
    /// Tasks have no ordering among themselves. A task that fails, or even
    /// panics, does not affect the others; its outcome records the failure.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBatch`] if `count` is zero.
    /// - [`Error::PoolUnavailable`] if every task failed to connect.
    pub async fn run_batch(
        &self,
        count: usize,
        policy: TimeoutPolicy,
        body: Arc<dyn TaskBody>,
    ) -> Result<BatchReport> {
        if count == 0 {
            return Err(Error::InvalidBatch(
                "a batch needs at least one task".to_string(),
            ));
        }

        let pool = self.executor.pool();
        pool.reset_peak_in_use();
        let pool_before = pool.stats();
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let policy = Arc::new(policy);
        let span = info_span!("batch", %batch_id, policy = %policy.name, count);

        let handles: Vec<_> = (1..=count)
            .map(|task| {
                let executor = self.executor.clone();
                let policy = Arc::clone(&policy);
                let body = Arc::clone(&body);
                tokio::spawn(
                    async move {
                        let outcome = executor.execute(&policy, body.as_ref(), task).await;
                        info!(kind = %outcome.kind, "done");
                        outcome
                    }
                    .instrument(info_span!(parent: &span, "task", task)),
                )
            })
            .collect();

        let outcomes: Vec<ExecutionOutcome> = join_all(handles)
            .await
            .into_iter()
            .zip(1..)
            .map(|(joined, task)| {
                joined.unwrap_or_else(|err| {
                    error!(parent: &span, task, error = %err, "task did not complete");
                    ExecutionOutcome::lost(task, format!("task {task} did not complete: {err}"))
                })
            })
            .collect();

        // A checkout timeout is a per-task outcome; only refused or closed
        // connections make the whole batch unavailable.
        let unreachable = outcomes
            .iter()
            .all(|o| o.connection_id.is_none() && o.kind == OutcomeKind::ConnectionFailed);
        if unreachable {
            let reason = outcomes
                .first()
                .map(|o| o.message.clone())
                .unwrap_or_default();
            return Err(Error::PoolUnavailable { reason });
        }

        let report = BatchReport {
            batch_id,
            policy: policy.name.clone(),
            started_at,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcomes,
            pool_before,
            pool_after: pool.stats(),
        };
        info!(
            parent: &span,
            successes = report.successes(),
            elapsed_ms = report.elapsed_ms,
            "batch joined"
        );
        Ok(report)
    }
}

/// Everything a scenario run needs: engine, pool, harness and settings.
///
/// Build one with [`bootstrap`](Self::bootstrap) and tear it down with
/// [`shutdown`](Self::shutdown). Contexts are independent of each other.
pub struct HarnessContext {
    engine: Engine,
    pool: ConnectionPool,
    harness: ConcurrencyHarness,
    config: Config,
    baseline_pool: PoolConfig,
    gate: Mutex<()>,
}

impl HarnessContext {
    /// Opens the engine, creates the pool, and prepares table `t` with the
    /// baseline row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the schema or
    /// seed commands fail.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let store = match &config.engine.database {
            Some(path) => ResourceStore::open(path)
                .map_err(|err| Error::db(format!("open {}", path.display()), err))?,
            None => ResourceStore::in_memory().map_err(|err| Error::db("open store", err))?,
        };
        let engine = Engine::with_store(store, config.engine.engine_config());
        let baseline_pool = config.pool.pool_config();
        let pool = ConnectionPool::new(
            EngineDriver::new(engine.clone(), config.engine.user.clone()),
            baseline_pool.clone(),
        );

        let ctx = Self {
            harness: ConcurrencyHarness::new(pool.clone()),
            engine,
            pool,
            config,
            baseline_pool,
            gate: Mutex::new(()),
        };
        ctx.execute(SCHEMA, &[], "create schema").await?;
        ctx.reset_baseline().await?;
        info!(user = %ctx.config.engine.user, "harness ready");
        Ok(ctx)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn harness(&self) -> &ConcurrencyHarness {
        &self.harness
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pool limits from configuration, restored after every scenario.
    pub fn baseline_pool(&self) -> &PoolConfig {
        &self.baseline_pool
    }

    /// Runs one statement on a pooled connection.
    async fn execute(&self, sql: &str, params: &[Value], context: &str) -> Result<Execution> {
        let mut conn = self.pool.checkout().await?;
        conn.execute(sql, params)
            .await
            .map_err(|err| Error::db(context, err))
    }

    /// Resets row `"ian"` to 777. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed command fails.
    pub async fn reset_baseline(&self) -> Result<()> {
        self.execute(SEED, &[], "reset baseline").await?;
        info!("baseline reset");
        Ok(())
    }

    /// Sessions the engine reports for the configured user, the sampling
    /// connection included.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn count_connections(&self) -> Result<usize> {
        let sql = count_sessions_sql(&self.config.engine.user);
        let count = self
            .execute(&sql, &[], "count connections")
            .await?
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Committed value of the contended row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn current_value(&self) -> Result<Option<i64>> {
        Ok(self
            .execute(SELECT_ROW, &[], "read row")
            .await?
            .scalar()
            .and_then(Value::as_i64))
    }

    /// Runs `scenario` to completion. Runs are serialized; a second caller
    /// waits for the first to finish. The configured pool limits are back in
    /// place once the call returns or its future is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the scenario could not run at all. Task failures
    /// are part of the report.
    pub async fn invoke(&self, scenario: ScenarioKind) -> Result<ScenarioReport> {
        let _exclusive = self.exclusive().await;
        let _restore = RestorePool {
            pool: &self.pool,
            baseline: &self.baseline_pool,
        };
        scenarios::run(self, scenario).await
    }

    /// Resolves `name` and runs it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScenario`] for an unrecognized name.
    pub async fn invoke_named(&self, name: &str) -> Result<ScenarioReport> {
        let scenario: ScenarioKind = name.parse()?;
        self.invoke(scenario).await
    }

    /// Resets the baseline once no scenario is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed command fails.
    pub async fn reset(&self) -> Result<()> {
        let _exclusive = self.exclusive().await;
        self.reset_baseline().await
    }

    async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Closes the pool. In-flight connections close as they are released.
    pub fn shutdown(&self) {
        self.pool.close();
        info!("harness shut down");
    }
}

/// Puts the configured pool limits back when dropped, also when the run is
/// cancelled partway through.
struct RestorePool<'a> {
    pool: &'a ConnectionPool,
    baseline: &'a PoolConfig,
}

impl Drop for RestorePool<'_> {
    fn drop(&mut self) {
        self.pool.configure(self.baseline);
    }
}
