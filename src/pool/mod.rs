//! Client-side connection pool.
//!
//! Bounds the number of open connections, keeps a set of warm idle
//! connections for reuse and evicts connections by age. Modeled on the
//! pool semantics of Go's `database/sql`:
//!
//! - `max_open`: ceiling on open connections; checkouts beyond it wait.
//! - `max_idle`: ceiling on warm connections; extra releases close.
//! - `max_lifetime`: connections older than this are closed on release
//!   or by the background reaper.
//! - `max_idle_time`: idle connections unused for this long are closed by
//!   the reaper.
//!
//! A zero `max_open`/`max_idle` and a `None` duration mean "unbounded".
//!
//! # Thread Safety
//!
//! Counters and the idle set sit behind a `parking_lot::Mutex` that is never
//! held across an `.await`. Waiting checkouts park on a `tokio::sync::Notify`;
//! every release wakes one waiter, raising `max_open` or closing the pool
//! wakes them all.

mod connection;
mod driver;

#[cfg(test)]
mod tests;

pub use connection::{PooledConnection, Transaction};
pub use driver::{Driver, DriverConnection, EngineDriver};

use crate::constants::{DEFAULT_MAX_IDLE, MIN_REAP_INTERVAL};
use crate::engine::DbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Errors raised by the pool itself. Engine failures on an open connection
/// are reported as [`DbError`] by the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool was closed.
    #[error("connection pool is closed")]
    Closed,

    /// No connection became available within `checkout_timeout`.
    #[error("timed out after {}ms waiting for a connection", waited.as_millis())]
    CheckoutTimeout { waited: Duration },

    /// The driver could not open a connection.
    #[error("failed to open connection: {0}")]
    Connect(#[source] DbError),
}

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime: Option<Duration>,
    pub max_idle_time: Option<Duration>,
    /// Bound on the checkout wait. `None` waits as long as it takes.
    pub checkout_timeout: Option<Duration>,
    /// Issue `RESET ALL` before a used connection is handed out again, so
    /// session directives do not leak between transactions.
    pub reset_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 0,
            max_idle: DEFAULT_MAX_IDLE,
            max_lifetime: None,
            max_idle_time: None,
            checkout_timeout: None,
            reset_on_release: true,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open: usize,
    pub max_idle: usize,
    /// Open connections, in use or idle.
    pub open: usize,
    pub in_use: usize,
    pub idle: usize,
    /// Checkouts that had to wait for a connection.
    pub wait_count: u64,
    pub wait_duration_ms: u64,
    pub max_idle_closed: u64,
    pub max_lifetime_closed: u64,
    pub max_idle_time_closed: u64,
    /// Connections discarded because the engine terminated them.
    pub broken_closed: u64,
    /// Highest `in_use` since the last [`ConnectionPool::reset_peak_in_use`].
    pub peak_in_use: usize,
}

struct IdleConn {
    conn: Box<dyn DriverConnection>,
    created: Instant,
    idle_since: Instant,
    dirty: bool,
}

impl IdleConn {
    fn expired(&self, max_lifetime: Option<Duration>, now: Instant) -> bool {
        max_lifetime.is_some_and(|max| now.duration_since(self.created) >= max)
    }

    fn idle_too_long(&self, max_idle_time: Option<Duration>, now: Instant) -> bool {
        max_idle_time.is_some_and(|max| now.duration_since(self.idle_since) >= max)
    }
}

#[derive(Default)]
struct Counters {
    wait_count: u64,
    wait_duration: Duration,
    max_idle_closed: u64,
    max_lifetime_closed: u64,
    max_idle_time_closed: u64,
    broken_closed: u64,
    peak_in_use: usize,
}

struct PoolState {
    config: PoolConfig,
    /// Most recently released last.
    idle: Vec<IdleConn>,
    /// In use, idle, or being opened.
    num_open: usize,
    in_use: usize,
    closed: bool,
    counters: Counters,
    reaper: Option<AbortHandle>,
}

impl PoolState {
    fn has_room(&self) -> bool {
        self.config.max_open == 0 || self.num_open < self.config.max_open
    }

    fn take_in_use(&mut self) {
        self.in_use += 1;
        self.counters.peak_in_use = self.counters.peak_in_use.max(self.in_use);
    }

    /// Removes idle connections past their lifetime or idle time.
    fn reap(&mut self, now: Instant) -> Vec<IdleConn> {
        let max_lifetime = self.config.max_lifetime;
        let max_idle_time = self.config.max_idle_time;
        let mut closing = Vec::new();
        let mut kept = Vec::with_capacity(self.idle.len());
        for idle in self.idle.drain(..) {
            if idle.expired(max_lifetime, now) {
                self.counters.max_lifetime_closed += 1;
                closing.push(idle);
            } else if idle.idle_too_long(max_idle_time, now) {
                self.counters.max_idle_time_closed += 1;
                closing.push(idle);
            } else {
                kept.push(idle);
            }
        }
        self.idle = kept;
        self.num_open -= closing.len();
        closing
    }

    /// Closes idle connections beyond `max_idle`, keeping the oldest.
    fn shrink_idle(&mut self) -> Vec<IdleConn> {
        let max_idle = self.config.max_idle;
        if max_idle == 0 || self.idle.len() <= max_idle {
            return Vec::new();
        }
        let closing = self.idle.split_off(max_idle);
        self.counters.max_idle_closed += closing.len() as u64;
        self.num_open -= closing.len();
        closing
    }

    fn reap_interval(&self) -> Option<Duration> {
        let shortest = match (self.config.max_lifetime, self.config.max_idle_time) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some((shortest / 2).max(MIN_REAP_INTERVAL))
    }
}

enum Step {
    Reuse(IdleConn),
    Open,
    Wait,
}

pub(crate) struct PoolInner {
    driver: Box<dyn Driver>,
    state: Mutex<PoolState>,
    available: Notify,
}

impl PoolInner {
    fn next_step(&self, now: Instant) -> Result<(Step, Vec<IdleConn>), PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let max_lifetime = state.config.max_lifetime;
        let mut closing = Vec::new();
        while let Some(idle) = state.idle.pop() {
            if idle.expired(max_lifetime, now) {
                state.counters.max_lifetime_closed += 1;
                state.num_open -= 1;
                closing.push(idle);
            } else if !idle.conn.is_alive() {
                state.counters.broken_closed += 1;
                state.num_open -= 1;
                closing.push(idle);
            } else {
                state.take_in_use();
                return Ok((Step::Reuse(idle), closing));
            }
        }

        if state.has_room() {
            state.num_open += 1;
            state.take_in_use();
            return Ok((Step::Open, closing));
        }
        Ok((Step::Wait, closing))
    }

    /// Takes back a connection from a [`PooledConnection`].
    pub(crate) fn release(
        &self,
        conn: Box<dyn DriverConnection>,
        created: Instant,
        broken: bool,
        dirty: bool,
    ) {
        let now = Instant::now();
        let closing = {
            let mut state = self.state.lock();
            state.in_use -= 1;

            let over_ceiling = state.config.max_open > 0 && state.num_open > state.config.max_open;
            let idle_full = state.config.max_idle > 0 && state.idle.len() >= state.config.max_idle;
            let expired = state
                .config
                .max_lifetime
                .is_some_and(|max| now.duration_since(created) >= max);

            let close = if broken || !conn.is_alive() {
                state.counters.broken_closed += 1;
                true
            } else if state.closed || over_ceiling {
                true
            } else if expired {
                state.counters.max_lifetime_closed += 1;
                true
            } else if idle_full {
                state.counters.max_idle_closed += 1;
                true
            } else {
                false
            };

            if close {
                state.num_open -= 1;
                Some(conn)
            } else {
                state.idle.push(IdleConn {
                    conn,
                    created,
                    idle_since: now,
                    dirty,
                });
                None
            }
        };

        if let Some(conn) = closing {
            debug!(conn = conn.id(), broken, "connection closed on release");
        }
        self.available.notify_one();
    }

    /// Undoes the bookkeeping of a checkout whose connect failed.
    fn abandon_open(&self) {
        {
            let mut state = self.state.lock();
            state.num_open -= 1;
            state.in_use -= 1;
        }
        self.available.notify_one();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(reaper) = self.state.get_mut().reaper.take() {
            reaper.abort();
        }
    }
}

/// Bounded pool of engine connections.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are opened on demand.
    pub fn new<D: Driver>(driver: D, config: PoolConfig) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                driver: Box::new(driver),
                state: Mutex::new(PoolState {
                    config,
                    idle: Vec::new(),
                    num_open: 0,
                    in_use: 0,
                    closed: false,
                    counters: Counters::default(),
                    reaper: None,
                }),
                available: Notify::new(),
            }),
        };
        pool.restart_reaper();
        pool
    }

    /// Checks out a connection, waiting while the pool is at `max_open`.
    ///
    /// Reuses the most recently released idle connection when one is
    /// available, otherwise opens a new one.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Closed`] if the pool is closed.
    /// - [`PoolError::CheckoutTimeout`] if `checkout_timeout` elapses.
    /// - [`PoolError::Connect`] if the driver refuses a new connection.
    pub async fn checkout(&self) -> Result<PooledConnection, PoolError> {
        let started = Instant::now();
        let (deadline, reset) = {
            let state = self.inner.state.lock();
            (
                state.config.checkout_timeout.map(|timeout| started + timeout),
                state.config.reset_on_release,
            )
        };
        let mut waited = false;

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, closing) = self.inner.next_step(Instant::now())?;
            drop(closing);

            match step {
                Step::Reuse(idle) => {
                    self.record_wait(waited, started);
                    let needs_reset = reset && idle.dirty;
                    let mut conn = PooledConnection::new(
                        Arc::clone(&self.inner),
                        idle.conn,
                        idle.created,
                    );
                    if needs_reset && let Err(err) = conn.execute("RESET ALL", &[]).await {
                        debug!(conn = conn.id(), error = %err, "reset failed, discarding");
                        conn.mark_broken();
                        continue;
                    }
                    conn.clear_dirty();
                    trace!(conn = conn.id(), "reused idle connection");
                    return Ok(conn);
                },
                Step::Open => {
                    self.record_wait(waited, started);
                    return match self.inner.driver.connect().await {
                        Ok(conn) => {
                            debug!(conn = conn.id(), "opened connection");
                            Ok(PooledConnection::new(
                                Arc::clone(&self.inner),
                                conn,
                                Instant::now(),
                            ))
                        },
                        Err(err) => {
                            self.inner.abandon_open();
                            Err(PoolError::Connect(err))
                        },
                    };
                },
                Step::Wait => {
                    if !waited {
                        waited = true;
                        trace!("pool at max_open, waiting for a connection");
                    }
                    match deadline {
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                let waited = started.elapsed();
                                self.record_wait(true, started);
                                return Err(PoolError::CheckoutTimeout { waited });
                            }
                        },
                        None => notified.await,
                    }
                },
            }
        }
    }

    fn record_wait(&self, waited: bool, started: Instant) {
        if waited {
            let mut state = self.inner.state.lock();
            state.counters.wait_count += 1;
            state.counters.wait_duration += started.elapsed();
        }
    }

    /// Sets the ceiling on open connections. Zero is unbounded.
    ///
    /// As in `database/sql`, a `max_idle` above the new ceiling is lowered
    /// to it.
    pub fn set_max_open(&self, max_open: usize) {
        let closing = {
            let mut state = self.inner.state.lock();
            state.config.max_open = max_open;
            if max_open > 0 && (state.config.max_idle == 0 || state.config.max_idle > max_open) {
                state.config.max_idle = max_open;
            }
            state.shrink_idle()
        };
        drop(closing);
        info!(max_open, "pool max_open set");
        self.inner.available.notify_waiters();
    }

    /// Sets the ceiling on idle connections. Zero is unbounded.
    ///
    /// Clamped to `max_open` when that is bounded.
    pub fn set_max_idle(&self, max_idle: usize) {
        let closing = {
            let mut state = self.inner.state.lock();
            let max_open = state.config.max_open;
            state.config.max_idle = if max_open > 0 && (max_idle == 0 || max_idle > max_open) {
                max_open
            } else {
                max_idle
            };
            state.shrink_idle()
        };
        drop(closing);
        info!(max_idle, "pool max_idle set");
    }

    /// Sets the maximum age of a connection. `None` keeps connections forever.
    pub fn set_max_lifetime(&self, max_lifetime: Option<Duration>) {
        let closing = {
            let mut state = self.inner.state.lock();
            state.config.max_lifetime = max_lifetime;
            state.reap(Instant::now())
        };
        drop(closing);
        info!(?max_lifetime, "pool max_lifetime set");
        self.restart_reaper();
    }

    /// Sets how long a connection may sit idle. `None` disables the limit.
    pub fn set_max_idle_time(&self, max_idle_time: Option<Duration>) {
        let closing = {
            let mut state = self.inner.state.lock();
            state.config.max_idle_time = max_idle_time;
            state.reap(Instant::now())
        };
        drop(closing);
        info!(?max_idle_time, "pool max_idle_time set");
        self.restart_reaper();
    }

    pub fn set_checkout_timeout(&self, checkout_timeout: Option<Duration>) {
        self.inner.state.lock().config.checkout_timeout = checkout_timeout;
    }

    /// Applies every limit of `config`.
    pub fn configure(&self, config: &PoolConfig) {
        self.set_max_open(config.max_open);
        self.set_max_idle(config.max_idle);
        self.set_max_lifetime(config.max_lifetime);
        self.set_max_idle_time(config.max_idle_time);
        let mut state = self.inner.state.lock();
        state.config.checkout_timeout = config.checkout_timeout;
        state.config.reset_on_release = config.reset_on_release;
    }

    /// Current limits.
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max_open: state.config.max_open,
            max_idle: state.config.max_idle,
            open: state.num_open,
            in_use: state.in_use,
            idle: state.idle.len(),
            wait_count: state.counters.wait_count,
            wait_duration_ms: u64::try_from(state.counters.wait_duration.as_millis())
                .unwrap_or(u64::MAX),
            max_idle_closed: state.counters.max_idle_closed,
            max_lifetime_closed: state.counters.max_lifetime_closed,
            max_idle_time_closed: state.counters.max_idle_time_closed,
            broken_closed: state.counters.broken_closed,
            peak_in_use: state.counters.peak_in_use,
        }
    }

    /// Restarts peak tracking from the current in-use count.
    pub fn reset_peak_in_use(&self) {
        let mut state = self.inner.state.lock();
        state.counters.peak_in_use = state.in_use;
    }

    /// Backend ids of the idle connections, most recently released last.
    pub fn idle_ids(&self) -> Vec<u64> {
        self.inner
            .state
            .lock()
            .idle
            .iter()
            .map(|idle| idle.conn.id())
            .collect()
    }

    /// Closes idle connections past their lifetime or idle time now.
    pub fn reap(&self) {
        let closing = self.inner.state.lock().reap(Instant::now());
        if !closing.is_empty() {
            debug!(closed = closing.len(), "reaped idle connections");
        }
    }

    /// Stops handing out connections and closes the idle ones.
    ///
    /// Connections in use are closed when they are released. Waiting
    /// checkouts fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let closing = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            if let Some(reaper) = state.reaper.take() {
                reaper.abort();
            }
            let closing = std::mem::take(&mut state.idle);
            state.num_open -= closing.len();
            closing
        };
        info!(closed = closing.len(), "connection pool closed");
        drop(closing);
        self.inner.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn restart_reaper(&self) {
        let mut state = self.inner.state.lock();
        if let Some(reaper) = state.reaper.take() {
            reaper.abort();
        }
        if state.closed || state.reap_interval().is_none() {
            return;
        }
        // Setters may run outside a runtime; eviction then happens on release.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        state.reaper = Some(handle.spawn(reaper_loop(pool)).abort_handle());
    }
}

async fn reaper_loop(pool: Weak<PoolInner>) {
    loop {
        let interval = match pool.upgrade() {
            Some(inner) => inner.state.lock().reap_interval(),
            None => return,
        };
        let Some(interval) = interval else {
            return;
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = pool.upgrade() else {
            return;
        };
        let closing = inner.state.lock().reap(Instant::now());
        if !closing.is_empty() {
            debug!(closed = closing.len(), "reaped idle connections");
        }
    }
}
