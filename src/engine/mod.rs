//! Embedded relational engine with PostgreSQL timeout semantics.
//!
//! The harness treats the engine as a remote server reached through SQL
//! commands. This module provides that server in-process: table `t` stored
//! in SQLite, row-level locks, and the three session timeouts the harness
//! experiments with.
//!
//! # Example
//!
//! ```ignore
//! use lockbench::engine::Engine;
//!
//! let engine = Engine::in_memory()?;
//! let mut session = engine.connect("postgres").await?;
//! session.execute("CREATE TABLE IF NOT EXISTS t (id, name UNIQUE, num)", &[]).await?;
//! session.execute("SET lock_timeout=1500", &[]).await?;
//! session.execute("UPDATE t SET num=$1 WHERE name='ian'", &[Value::Integer(1)]).await?;
//! ```
//!
//! ## Timeouts
//!
//! - `lock_timeout`: bounds the wait for a row lock (`55P03`).
//! - `statement_timeout`: bounds any single statement (`57014`).
//! - `idle_in_transaction_session_timeout`: bounds idle time inside an open
//!   transaction; the session is terminated (`FATAL 25P03`).

mod error;
mod locks;
mod session;
pub mod statement;
mod store;
mod types;


pub use error::{DbError, Severity, SqlState};
pub use locks::{LockTable, RowLock};
pub use session::{Session, SessionActivity, SessionId, SessionState, Timeouts};
pub use store::{ResourceStore, RowWrite};
pub use types::{CommandTag, Execution, Row, Value};

use dashmap::DashMap;
use session::SessionShared;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Server-level settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrent sessions; further connects fail with `53300`.
    /// Zero lifts the limit.
    pub max_connections: usize,
    /// Simulated network round trip per statement and handshake. Zero still
    /// yields to the scheduler once.
    pub latency: Duration,
    /// Values restored by `RESET` and `SET ... = DEFAULT`.
    pub defaults: Timeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: crate::constants::DEFAULT_MAX_CONNECTIONS,
            latency: Duration::ZERO,
            defaults: Timeouts::default(),
        }
    }
}

pub(crate) struct EngineCore {
    store: ResourceStore,
    locks: LockTable,
    sessions: DashMap<SessionId, Arc<SessionShared>>,
    live: AtomicUsize,
    next_pid: AtomicU64,
    config: EngineConfig,
}

impl EngineCore {
    async fn round_trip(&self) {
        if self.config.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    fn count_sessions(&self, user: Option<&str>) -> usize {
        match user {
            Some(user) => self
                .sessions
                .iter()
                .filter(|entry| entry.value().user() == user)
                .count(),
            None => self.sessions.len(),
        }
    }

    fn deregister(&self, pid: SessionId) {
        if self.sessions.remove(&pid).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Handle to the engine. Cheap to clone; all clones share one server.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Creates an engine over a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQLite store cannot be created.
    pub fn in_memory() -> Result<Self, DbError> {
        Ok(Self::with_store(
            ResourceStore::in_memory()?,
            EngineConfig::default(),
        ))
    }

    pub fn with_store(store: ResourceStore, config: EngineConfig) -> Self {
        Self {
            core: Arc::new(EngineCore {
                store,
                locks: LockTable::new(),
                sessions: DashMap::new(),
                live: AtomicUsize::new(0),
                next_pid: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Opens a new session for `user`.
    ///
    /// # Errors
    ///
    /// Returns a FATAL `53300` when `max_connections` sessions are open.
    pub async fn connect(&self, user: &str) -> Result<Session, DbError> {
        self.core.round_trip().await;

        let max = self.core.config.max_connections;
        self.core
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (max == 0 || live < max).then_some(live + 1)
            })
            .map_err(|_| {
                DbError::fatal(SqlState::TooManyConnections, "sorry, too many clients already")
            })?;

        let pid = self.core.next_pid.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared::new(pid, user, self.core.config.defaults));
        self.core.sessions.insert(pid, Arc::clone(&shared));
        debug!(pid, user, "session opened");
        Ok(Session::new(shared, Arc::clone(&self.core)))
    }

    /// Number of live sessions, optionally filtered by user.
    ///
    /// Same answer as `SELECT count(*) FROM pg_stat_activity WHERE usename = ...`
    /// without needing a session of its own.
    pub fn active_sessions(&self, user: Option<&str>) -> usize {
        self.core.count_sessions(user)
    }

    /// Snapshot of every live session, ordered by pid.
    pub fn activity(&self) -> Vec<SessionActivity> {
        let sessions: Vec<Arc<SessionShared>> = self
            .core
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut rows: Vec<SessionActivity> = sessions.iter().map(|s| s.activity()).collect();
        rows.sort_by_key(|row| row.pid);
        rows
    }

    pub fn store(&self) -> &ResourceStore {
        &self.core.store
    }

    /// True while some transaction holds the lock on row `key`.
    pub fn is_row_locked(&self, key: &str) -> bool {
        self.core.locks.is_locked(key)
    }
}
