//! Engine error reports.
//!
//! Every failure the engine reports carries a severity and a five-character
//! SQLSTATE code, the same shape a PostgreSQL server uses, so clients can
//! classify failures without parsing messages.

use serde::Serialize;
use std::fmt;

/// SQLSTATE conditions the engine can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[non_exhaustive]
pub enum SqlState {
    /// `55P03`: a row lock could not be acquired within `lock_timeout`.
    LockNotAvailable,
    /// `57014`: statement canceled, here always by `statement_timeout`.
    QueryCanceled,
    /// `25P03`: session terminated by `idle_in_transaction_session_timeout`.
    IdleInTransactionSessionTimeout,
    /// `25P02`: statement issued inside an aborted transaction.
    InFailedSqlTransaction,
    /// `40000`: a commit ended as a rollback.
    TransactionRollback,
    /// `08003`: the connection is already gone.
    ConnectionDoesNotExist,
    /// `53300`: `max_connections` reached.
    TooManyConnections,
    /// `23505`
    UniqueViolation,
    /// `42601`
    SyntaxError,
    /// `42P01`
    UndefinedTable,
    /// `42P07`
    DuplicateTable,
    /// `42704`: unknown configuration parameter.
    UndefinedObject,
    /// `22023`
    InvalidParameterValue,
    /// `0A000`
    FeatureNotSupported,
    /// `XX000`
    InternalError,
}

impl SqlState {
    /// Returns the five-character SQLSTATE code.
    pub fn code(self) -> &'static str {
        match self {
            Self::LockNotAvailable => "55P03",
            Self::QueryCanceled => "57014",
            Self::IdleInTransactionSessionTimeout => "25P03",
            Self::InFailedSqlTransaction => "25P02",
            Self::TransactionRollback => "40000",
            Self::ConnectionDoesNotExist => "08003",
            Self::TooManyConnections => "53300",
            Self::UniqueViolation => "23505",
            Self::SyntaxError => "42601",
            Self::UndefinedTable => "42P01",
            Self::DuplicateTable => "42P07",
            Self::UndefinedObject => "42704",
            Self::InvalidParameterValue => "22023",
            Self::FeatureNotSupported => "0A000",
            Self::InternalError => "XX000",
        }
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Severity of an engine report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The statement failed; the session survives.
    Error,
    /// The session was terminated.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("ERROR"),
            Self::Fatal => f.write_str("FATAL"),
        }
    }
}

/// Error reported by the engine for a single command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{severity}: {message} (SQLSTATE {code})")]
pub struct DbError {
    pub severity: Severity,
    pub code: SqlState,
    pub message: String,
}

impl DbError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
        }
    }

    pub fn fatal(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            code,
            message: message.into(),
        }
    }

    pub fn lock_timeout() -> Self {
        Self::new(
            SqlState::LockNotAvailable,
            "canceling statement due to lock timeout",
        )
    }

    pub fn statement_timeout() -> Self {
        Self::new(
            SqlState::QueryCanceled,
            "canceling statement due to statement timeout",
        )
    }

    pub fn idle_in_transaction_timeout() -> Self {
        Self::fatal(
            SqlState::IdleInTransactionSessionTimeout,
            "terminating connection due to idle-in-transaction timeout",
        )
    }

    pub fn in_failed_transaction() -> Self {
        Self::new(
            SqlState::InFailedSqlTransaction,
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    pub fn connection_closed() -> Self {
        Self::new(SqlState::ConnectionDoesNotExist, "conn closed")
    }

    pub fn commit_rolled_back() -> Self {
        Self::new(
            SqlState::TransactionRollback,
            "commit unexpectedly resulted in rollback",
        )
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(SqlState::SyntaxError, message)
    }

    /// True when the session is gone and the connection must be discarded.
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal || self.code == SqlState::ConnectionDoesNotExist
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if message.contains("no such table") {
            Self::new(SqlState::UndefinedTable, message)
        } else {
            Self::new(SqlState::InternalError, message)
        }
    }
}
