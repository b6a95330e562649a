//! Crate-level error type.
//!
//! Per-task failures never surface here; they are folded into
//! [`ExecutionOutcome`](crate::txn::ExecutionOutcome)s. These errors stop a
//! whole scenario or the harness itself.

use crate::engine::DbError;
use crate::pool::PoolError;

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An engine command issued by the harness itself failed.
    #[error("{context}: {source}")]
    Db {
        context: String,
        #[source]
        source: DbError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// No task of a batch could reach the engine.
    #[error("no task could reach the engine: {reason}")]
    PoolUnavailable { reason: String },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("unknown scenario: {name}")]
    UnknownScenario { name: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an engine error with context.
    pub fn db(context: impl Into<String>, source: DbError) -> Self {
        Self::Db {
            context: context.into(),
            source,
        }
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn unknown_scenario(name: impl Into<String>) -> Self {
        Self::UnknownScenario { name: name.into() }
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownScenario { .. } => 404,
            Self::InvalidBatch(_) => 400,
            Self::PoolUnavailable { .. } | Self::Pool(_) => 503,
            Self::Db { .. } | Self::Config(_) | Self::Io { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::unknown_scenario("nope").status_code(), 404);
        assert_eq!(Error::InvalidBatch("count".into()).status_code(), 400);
        assert_eq!(Error::Pool(PoolError::Closed).status_code(), 503);
        assert_eq!(
            Error::db("seed", DbError::connection_closed()).status_code(),
            500
        );
    }

    #[test]
    fn test_db_error_keeps_context() {
        let err = Error::db("bootstrap schema", DbError::syntax("bad"));
        assert!(err.to_string().starts_with("bootstrap schema: ERROR: bad"));
    }
}
