//! Driver trait for the connection pool.
//!
//! Defines the link between the pool and whatever serves the SQL commands,
//! so the pool can be exercised against the embedded engine or against a
//! driver that injects faults.

use crate::engine::{DbError, Engine, Execution, Session, Value};
use async_trait::async_trait;

/// Opens connections for the pool.
///
/// Implementations must be thread-safe; the pool calls `connect` from any
/// task that needs a fresh connection.
///
/// # Example
///
/// ```ignore
/// use lockbench::pool::{ConnectionPool, EngineDriver, PoolConfig};
///
/// let driver = EngineDriver::new(engine, "postgres");
/// let pool = ConnectionPool::new(driver, PoolConfig::default());
/// let mut conn = pool.checkout().await?;
/// ```
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns the engine's report when the connection is refused.
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DbError>;
}

/// One open connection handed out by a [`Driver`].
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Backend identifier, stable for the connection's lifetime.
    fn id(&self) -> u64;

    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns the engine's report for the statement.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError>;

    /// False once the server side of the connection is gone.
    fn is_alive(&self) -> bool;
}

/// Driver for the embedded engine.
#[derive(Clone)]
pub struct EngineDriver {
    engine: Engine,
    user: String,
}

impl EngineDriver {
    pub fn new(engine: Engine, user: impl Into<String>) -> Self {
        Self {
            engine,
            user: user.into(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait]
impl Driver for EngineDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DbError> {
        let session = self.engine.connect(&self.user).await?;
        Ok(Box::new(session))
    }
}

#[async_trait]
impl DriverConnection for Session {
    fn id(&self) -> u64 {
        Session::id(self)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Execution, DbError> {
        Session::execute(self, sql, params).await
    }

    fn is_alive(&self) -> bool {
        Session::is_alive(self)
    }
}
