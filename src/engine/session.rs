//! Engine sessions.
//!
//! A [`Session`] is one backend connection. Statements on a session run one
//! at a time (`&mut self`); the only other party touching session state is
//! the idle-in-transaction watchdog, which acts strictly while the session is
//! between statements.
//!
//! ## Transaction states
//!
//! - **No transaction**: statements run in an implicit transaction.
//! - **Active**: after `BEGIN`; writes are buffered and row locks held.
//! - **Aborted**: after any error inside the block; only `COMMIT` or
//!   `ROLLBACK` are accepted and both roll back.
//! - **Terminated**: the watchdog fired; the next command reports the
//!   FATAL error and the session is closed for good.

use super::EngineCore;
use super::error::DbError;
use super::locks::RowLock;
use super::statement::{self, SetValue, Setting, Statement};
use super::store::{RowWrite, duplicate_key};
use super::types::{CommandTag, Execution, Row, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Backend process identifier.
pub type SessionId = u64;

/// Timeout settings of one session. A zero duration disables the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timeouts {
    pub lock: Duration,
    pub statement: Duration,
    pub idle_in_transaction: Duration,
}

impl Timeouts {
    pub fn get(&self, setting: Setting) -> Duration {
        match setting {
            Setting::LockTimeout => self.lock,
            Setting::StatementTimeout => self.statement,
            Setting::IdleInTransactionSessionTimeout => self.idle_in_transaction,
        }
    }

    pub fn set(&mut self, setting: Setting, value: Duration) {
        match setting {
            Setting::LockTimeout => self.lock = value,
            Setting::StatementTimeout => self.statement = value,
            Setting::IdleInTransactionSessionTimeout => self.idle_in_transaction = value,
        }
    }
}

/// Session state as reported by the activity view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    IdleInTransaction,
    IdleInTransactionAborted,
}

/// One row of the activity view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionActivity {
    pub pid: SessionId,
    pub usename: String,
    pub state: SessionState,
}

struct TxnState {
    /// Settings at `BEGIN`, restored on rollback.
    saved: Timeouts,
    /// Settings that survive a commit (plain `SET`, not `SET LOCAL`).
    session_level: Timeouts,
    aborted: bool,
    locks: Vec<RowLock>,
    writes: BTreeMap<String, RowWrite>,
}

impl TxnState {
    fn new(settings: Timeouts) -> Self {
        Self {
            saved: settings,
            session_level: settings,
            aborted: false,
            locks: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    fn holds(&self, key: &str) -> bool {
        self.locks.iter().any(|lock| lock.key() == key)
    }

    fn record(&mut self, key: String, write: RowWrite, lock: Option<RowLock>) {
        if let Some(lock) = lock {
            self.locks.push(lock);
        }
        let folded = match self.writes.get(&key) {
            Some(earlier) => earlier.then(write),
            None => write,
        };
        self.writes.insert(key, folded);
    }
}

enum Status {
    Open,
    /// Killed by the engine; the error is reported to the next command.
    Terminated(DbError),
    Closed,
}

struct SessionInner {
    settings: Timeouts,
    txn: Option<TxnState>,
    busy: bool,
    /// Bumped at the start and end of every statement.
    epoch: u64,
    status: Status,
    watchdog: Option<AbortHandle>,
}

pub(crate) struct SessionShared {
    id: SessionId,
    user: String,
    inner: Mutex<SessionInner>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, user: &str, settings: Timeouts) -> Self {
        Self {
            id,
            user: user.to_string(),
            inner: Mutex::new(SessionInner {
                settings,
                txn: None,
                busy: false,
                epoch: 0,
                status: Status::Open,
                watchdog: None,
            }),
        }
    }

    pub(crate) fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn activity(&self) -> SessionActivity {
        let inner = self.inner.lock();
        let state = match (&inner.txn, inner.busy) {
            (_, true) => SessionState::Active,
            (None, false) => SessionState::Idle,
            (Some(txn), false) if txn.aborted => SessionState::IdleInTransactionAborted,
            (Some(_), false) => SessionState::IdleInTransaction,
        };
        SessionActivity {
            pid: self.id,
            usename: self.user.clone(),
            state,
        }
    }

    /// Called by the watchdog once the idle threshold has elapsed.
    fn expire_idle(&self, epoch: u64, engine: &EngineCore) {
        let txn = {
            let mut inner = self.inner.lock();
            if inner.busy
                || inner.epoch != epoch
                || inner.txn.is_none()
                || !matches!(inner.status, Status::Open)
            {
                return;
            }
            inner.status = Status::Terminated(DbError::idle_in_transaction_timeout());
            inner.watchdog = None;
            inner.txn.take()
        };
        engine.deregister(self.id);
        drop(txn);
        warn!(
            pid = self.id,
            user = %self.user,
            "terminating connection due to idle-in-transaction timeout"
        );
    }
}

/// A live backend connection.
///
/// Dropping the session disconnects it: any open transaction is rolled
/// back and its row locks are released.
pub struct Session {
    shared: Arc<SessionShared>,
    engine: Arc<EngineCore>,
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>, engine: Arc<EngineCore>) -> Self {
        Self { shared, engine }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn user(&self) -> &str {
        &self.shared.user
    }

    /// False once the engine has terminated the session or it was closed.
    pub fn is_alive(&self) -> bool {
        matches!(self.shared.inner.lock().status, Status::Open)
    }

    /// Current timeout settings.
    pub fn timeouts(&self) -> Timeouts {
        self.shared.inner.lock().settings
    }

    /// True while a transaction block is open.
    pub fn in_transaction(&self) -> bool {
        self.shared.inner.lock().txn.is_some()
    }

    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns the engine's report for the statement. A FATAL report means
    /// the session is gone; every later call fails with `08003`.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        let timeouts = self.start_statement()?;
        self.engine.round_trip().await;

        let result = match statement::parse(sql, params) {
            Ok(statement) => self.run_with_timeout(statement, timeouts.statement).await,
            Err(err) => Err(err),
        };

        self.finish_statement(&result);
        result
    }

    fn start_statement(&self) -> Result<Timeouts, DbError> {
        let mut inner = self.shared.inner.lock();
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        match std::mem::replace(&mut inner.status, Status::Closed) {
            Status::Open => inner.status = Status::Open,
            Status::Terminated(fatal) => return Err(fatal),
            Status::Closed => return Err(DbError::connection_closed()),
        }
        inner.busy = true;
        inner.epoch += 1;
        Ok(inner.settings)
    }

    fn finish_statement(&self, result: &Result<Execution, DbError>) {
        let mut inner = self.shared.inner.lock();
        inner.busy = false;
        inner.epoch += 1;

        if let Err(err) = result
            && let Some(txn) = inner.txn.as_mut()
        {
            if !txn.aborted {
                debug!(pid = self.shared.id, error = %err, "transaction aborted");
            }
            txn.aborted = true;
        }

        let idle_timeout = inner.settings.idle_in_transaction;
        if inner.txn.is_some() && !idle_timeout.is_zero() {
            inner.watchdog = Some(self.arm_idle_watchdog(inner.epoch, idle_timeout));
        }
    }

    fn arm_idle_watchdog(&self, epoch: u64, after: Duration) -> AbortHandle {
        let session: Weak<SessionShared> = Arc::downgrade(&self.shared);
        let engine: Weak<EngineCore> = Arc::downgrade(&self.engine);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let (Some(session), Some(engine)) = (session.upgrade(), engine.upgrade()) {
                session.expire_idle(epoch, &engine);
            }
        })
        .abort_handle()
    }

    async fn run_with_timeout(
        &mut self,
        statement: Statement,
        statement_timeout: Duration,
    ) -> Result<Execution, DbError> {
        if statement_timeout.is_zero() {
            return self.run(statement).await;
        }
        match tokio::time::timeout(statement_timeout, self.run(statement)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::statement_timeout()),
        }
    }

    async fn run(&mut self, statement: Statement) -> Result<Execution, DbError> {
        {
            let inner = self.shared.inner.lock();
            if inner.txn.as_ref().is_some_and(|txn| txn.aborted) && !statement.ends_transaction() {
                return Err(DbError::in_failed_transaction());
            }
        }

        match statement {
            Statement::Begin => Ok(self.begin()),
            Statement::Commit => self.commit(),
            Statement::Rollback => Ok(self.rollback()),
            Statement::Set {
                setting,
                value,
                local,
            } => Ok(self.set(setting, value, local)),
            Statement::Reset(setting) => {
                self.set(setting, SetValue::Default, false);
                Ok(Execution::tag(CommandTag::Reset))
            },
            Statement::ResetAll => {
                for setting in [
                    Setting::LockTimeout,
                    Setting::StatementTimeout,
                    Setting::IdleInTransactionSessionTimeout,
                ] {
                    self.set(setting, SetValue::Default, false);
                }
                Ok(Execution::tag(CommandTag::Reset))
            },
            Statement::CreateTable { if_not_exists } => {
                self.engine.store.create_table(if_not_exists)?;
                Ok(Execution::tag(CommandTag::CreateTable))
            },
            Statement::Insert {
                key,
                num,
                on_conflict,
            } => self.insert(key, num, on_conflict).await,
            Statement::Update { key, num } => self.update(key, num).await,
            Statement::SelectNum { key } => self.select_num(&key),
            Statement::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Execution::rows(vec![Row::single("pg_sleep", Value::Null)]))
            },
            Statement::CountSessions { user } => {
                let count = self.engine.count_sessions(user.as_deref());
                Ok(Execution::rows(vec![Row::single(
                    "count",
                    Value::Integer(i64::try_from(count).unwrap_or(i64::MAX)),
                )]))
            },
        }
    }

    fn begin(&mut self) -> Execution {
        let mut inner = self.shared.inner.lock();
        if inner.txn.is_some() {
            warn!(pid = self.shared.id, "there is already a transaction in progress");
        } else {
            let settings = inner.settings;
            inner.txn = Some(TxnState::new(settings));
        }
        Execution::tag(CommandTag::Begin)
    }

    fn commit(&mut self) -> Result<Execution, DbError> {
        let mut inner = self.shared.inner.lock();
        let Some(txn) = inner.txn.take() else {
            warn!(pid = self.shared.id, "there is no transaction in progress");
            return Ok(Execution::tag(CommandTag::Commit));
        };

        if txn.aborted {
            inner.settings = txn.saved;
            return Ok(Execution::tag(CommandTag::Rollback));
        }

        // Writes become visible before the row locks are released.
        match self.engine.store.apply(&txn.writes) {
            Ok(()) => {
                inner.settings = txn.session_level;
                Ok(Execution::tag(CommandTag::Commit))
            },
            Err(err) => {
                inner.settings = txn.saved;
                Err(err)
            },
        }
    }

    fn rollback(&mut self) -> Execution {
        let mut inner = self.shared.inner.lock();
        match inner.txn.take() {
            Some(txn) => inner.settings = txn.saved,
            None => warn!(pid = self.shared.id, "there is no transaction in progress"),
        }
        Execution::tag(CommandTag::Rollback)
    }

    fn set(&mut self, setting: Setting, value: SetValue, local: bool) -> Execution {
        let value = match value {
            SetValue::Default => self.engine.config.defaults.get(setting),
            SetValue::Duration(duration) => duration,
        };

        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        match inner.txn.as_mut() {
            Some(txn) if !local => txn.session_level.set(setting, value),
            Some(_) => {},
            None if local => {
                warn!(
                    pid = self.shared.id,
                    "SET LOCAL can only be used in transaction blocks"
                );
                return Execution::tag(CommandTag::Set);
            },
            None => {},
        }
        inner.settings.set(setting, value);
        Execution::tag(CommandTag::Set)
    }

    /// Takes the row lock for `key` unless this transaction already holds it.
    async fn lock_row(&self, key: &str) -> Result<Option<RowLock>, DbError> {
        let (lock_timeout, held) = {
            let inner = self.shared.inner.lock();
            let held = inner.txn.as_ref().is_some_and(|txn| txn.holds(key));
            (inner.settings.lock, held)
        };
        if held {
            return Ok(None);
        }
        self.engine.locks.acquire(key, lock_timeout).await.map(Some)
    }

    async fn update(&mut self, key: String, num: i64) -> Result<Execution, DbError> {
        let lock = self.lock_row(&key).await?;

        let mut inner = self.shared.inner.lock();
        let pending = inner.txn.as_ref().and_then(|txn| txn.writes.get(&key).copied());
        let exists = pending.is_some() || self.engine.store.get(&key)?.is_some();
        if !exists {
            return Ok(Execution::affected(CommandTag::Update, 0));
        }

        let write = RowWrite::Update(num);
        match inner.txn.as_mut() {
            Some(txn) => txn.record(key, write, lock),
            None => self.engine.store.apply([(&key, &write)])?,
        }
        Ok(Execution::affected(CommandTag::Update, 1))
    }

    async fn insert(
        &mut self,
        key: String,
        num: i64,
        on_conflict: Option<i64>,
    ) -> Result<Execution, DbError> {
        let lock = self.lock_row(&key).await?;

        let mut inner = self.shared.inner.lock();
        let pending = inner.txn.as_ref().and_then(|txn| txn.writes.get(&key).copied());
        let exists = pending.is_some() || self.engine.store.get(&key)?.is_some();

        let write = match on_conflict {
            Some(on_conflict) => RowWrite::Upsert { num, on_conflict },
            None if exists => return Err(duplicate_key(&key)),
            None => RowWrite::Insert(num),
        };
        match inner.txn.as_mut() {
            Some(txn) => txn.record(key, write, lock),
            None => self.engine.store.apply([(&key, &write)])?,
        }
        Ok(Execution::affected(CommandTag::Insert, 1))
    }

    fn select_num(&self, key: &str) -> Result<Execution, DbError> {
        let inner = self.shared.inner.lock();
        let committed = self.engine.store.get(key)?;
        let pending = inner.txn.as_ref().and_then(|txn| txn.writes.get(key).copied());
        let visible = match pending {
            Some(write) => Some(write.visible_value(committed)),
            None => committed,
        };
        let rows = visible
            .map(|num| vec![Row::single("num", Value::Integer(num))])
            .unwrap_or_default();
        Ok(Execution::rows(rows))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let txn = {
            let mut inner = self.shared.inner.lock();
            if let Some(watchdog) = inner.watchdog.take() {
                watchdog.abort();
            }
            inner.status = Status::Closed;
            inner.txn.take()
        };
        drop(txn);
        self.engine.deregister(self.shared.id);
        debug!(pid = self.shared.id, "session closed");
    }
}
