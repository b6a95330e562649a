//! Tests for the connection pool.

use super::*;
use crate::engine::{Engine, EngineConfig, Execution, ResourceStore, SqlState, Value};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Engine {
    Engine::in_memory().unwrap()
}

fn pool(engine: &Engine, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(EngineDriver::new(engine.clone(), "postgres"), config)
}

/// Driver that logs every statement sent over its connections.
struct RecordingDriver {
    inner: EngineDriver,
    log: Arc<parking_lot::Mutex<Vec<String>>>,
}

struct RecordingConnection {
    inner: Box<dyn DriverConnection>,
    log: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DbError> {
        Ok(Box::new(RecordingConnection {
            inner: self.inner.connect().await?,
            log: Arc::clone(&self.log),
        }))
    }
}

#[async_trait]
impl DriverConnection for RecordingConnection {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        self.log.lock().push(sql.to_string());
        self.inner.execute(sql, params).await
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }
}

// =============================================================================
// Checkout and release
// =============================================================================

#[tokio::test]
async fn test_released_connection_is_reused() {
    let engine = engine();
    let pool = pool(&engine, PoolConfig::default());

    let first = pool.checkout().await.unwrap();
    let id = first.id();
    assert_eq!(pool.stats().in_use, 1);
    drop(first);

    assert_eq!(pool.idle_ids(), vec![id]);
    let again = pool.checkout().await.unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(pool.stats().open, 1);
    assert_eq!(engine.active_sessions(Some("postgres")), 1);
}

#[tokio::test]
async fn test_idle_set_bounded_by_max_idle() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_idle: 1,
            ..PoolConfig::default()
        },
    );

    let a = pool.checkout().await.unwrap();
    let b = pool.checkout().await.unwrap();
    let c = pool.checkout().await.unwrap();
    assert_eq!(pool.stats().open, 3);
    drop((a, b, c));

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.open, 1);
    assert_eq!(stats.max_idle_closed, 2);
    assert_eq!(engine.active_sessions(None), 1);
}

#[tokio::test]
async fn test_set_max_idle_closes_surplus() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_idle: 0,
            ..PoolConfig::default()
        },
    );
    let conns: Vec<_> = futures::future::join_all((0..4).map(|_| pool.checkout())).await;
    drop(conns);
    assert_eq!(pool.stats().idle, 4);

    pool.set_max_idle(2);
    assert_eq!(pool.stats().idle, 2);
    assert_eq!(engine.active_sessions(None), 2);
}

#[tokio::test(start_paused = true)]
async fn test_max_open_blocks_extra_checkouts() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_open: 2,
            ..PoolConfig::default()
        },
    );

    let started = tokio::time::Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.checkout().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(conn);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.peak_in_use, 2);
    assert_eq!(stats.wait_count, 2);
    assert!(stats.open <= 2);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_raising_max_open_wakes_waiters() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_open: 1,
            ..PoolConfig::default()
        },
    );
    let _held = pool.checkout().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.checkout().await.map(|conn| conn.id()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    pool.set_max_open(0);
    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_checkout_timeout() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_open: 1,
            checkout_timeout: Some(Duration::from_millis(500)),
            ..PoolConfig::default()
        },
    );
    let _held = pool.checkout().await.unwrap();

    let err = pool.checkout().await.err().unwrap();
    match err {
        PoolError::CheckoutTimeout { waited } => assert!(waited >= Duration::from_millis(500)),
        other => panic!("expected checkout timeout, got {other}"),
    }
    assert_eq!(pool.stats().in_use, 1);
}

#[tokio::test]
async fn test_connect_failure_releases_slot() {
    let engine = Engine::with_store(
        ResourceStore::in_memory().unwrap(),
        EngineConfig {
            max_connections: 1,
            ..EngineConfig::default()
        },
    );
    let pool = pool(&engine, PoolConfig::default());
    let held = pool.checkout().await.unwrap();

    match pool.checkout().await.err().unwrap() {
        PoolError::Connect(err) => assert_eq!(err.code, SqlState::TooManyConnections),
        other => panic!("expected connect failure, got {other}"),
    }
    let stats = pool.stats();
    assert_eq!(stats.open, 1);
    assert_eq!(stats.in_use, 1);

    drop(held);
    assert!(pool.checkout().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_waiters_and_closes_idle() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_open: 1,
            ..PoolConfig::default()
        },
    );
    let held = pool.checkout().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.checkout().await.map(|conn| conn.id()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.close();
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));

    drop(held);
    assert_eq!(pool.stats().open, 0);
    assert_eq!(engine.active_sessions(None), 0);
    assert!(matches!(pool.checkout().await, Err(PoolError::Closed)));
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_lifetime_reaper_closes_idle_connections() {
    let engine = engine();
    let pool = pool(
        &engine,
        PoolConfig {
            max_idle: 10,
            max_lifetime: Some(Duration::from_secs(2)),
            ..PoolConfig::default()
        },
    );

    let conns: Vec<_> = futures::future::join_all((0..3).map(|_| pool.checkout())).await;
    drop(conns);
    assert_eq!(pool.stats().idle, 3);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let stats = pool.stats();
    assert_eq!(stats.open, 0);
    assert_eq!(stats.max_lifetime_closed, 3);
    assert_eq!(engine.active_sessions(None), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_time_reaper() {
    let engine = engine();
    let pool = pool(&engine, PoolConfig::default());
    drop(pool.checkout().await.unwrap());
    pool.set_max_idle_time(Some(Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.max_idle_time_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_connection_is_discarded() {
    let engine = engine();
    let pool = pool(&engine, PoolConfig::default());

    let mut conn = pool.checkout().await.unwrap();
    conn.execute("BEGIN", &[]).await.unwrap();
    conn.execute("SET idle_in_transaction_session_timeout=100", &[])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = conn.execute("COMMIT", &[]).await.unwrap_err();
    assert_eq!(err.code, SqlState::IdleInTransactionSessionTimeout);
    assert!(conn.is_broken());
    drop(conn);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.open, 0);
    assert_eq!(stats.broken_closed, 1);
}

#[tokio::test]
async fn test_unfinished_transaction_breaks_connection() {
    let engine = engine();
    let pool = pool(&engine, PoolConfig::default());

    let mut conn = pool.checkout().await.unwrap();
    {
        let tx = conn.begin().await.unwrap();
        assert!(!tx.is_finished());
    }
    assert!(conn.is_broken());
    drop(conn);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn test_settings_reset_before_reuse() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let driver = RecordingDriver {
        inner: EngineDriver::new(engine(), "postgres"),
        log: Arc::clone(&log),
    };
    let pool = ConnectionPool::new(driver, PoolConfig::default());

    let mut conn = pool.checkout().await.unwrap();
    conn.execute("SET lock_timeout=1500", &[]).await.unwrap();
    drop(conn);

    let conn = pool.checkout().await.unwrap();
    drop(conn);
    // An untouched connection is not reset again.
    let _conn = pool.checkout().await.unwrap();

    assert_eq!(
        *log.lock(),
        vec!["SET lock_timeout=1500".to_string(), "RESET ALL".to_string()]
    );
}
