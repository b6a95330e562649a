//! Timeout policies applied at transaction start.

use crate::engine::{DbError, statement::Setting};
use crate::pool::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The engine-side timeout a threshold configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Wait for a row lock (`lock_timeout`).
    Lock,
    /// Duration of one statement (`statement_timeout`).
    Statement,
    /// Idle time inside an open transaction
    /// (`idle_in_transaction_session_timeout`).
    IdleInTransaction,
}

impl TimeoutKind {
    /// Engine setting the kind maps to.
    pub fn setting(self) -> Setting {
        match self {
            Self::Lock => Setting::LockTimeout,
            Self::Statement => Setting::StatementTimeout,
            Self::IdleInTransaction => Setting::IdleInTransactionSessionTimeout,
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.setting().name())
    }
}

/// One `{kind, threshold}` entry of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub kind: TimeoutKind,
    pub threshold: Duration,
}

impl Threshold {
    /// The session directive that applies this threshold.
    pub fn directive(&self) -> String {
        format!("SET {}={}", self.kind, self.threshold.as_millis())
    }
}

/// Named, immutable set of timeout thresholds.
///
/// A policy holds at most one threshold per kind; adding a kind again
/// replaces the earlier threshold.
///
/// # Example
///
/// ```ignore
/// let policy = TimeoutPolicy::named("lock_timeout").lock(Duration::from_millis(1500));
/// assert_eq!(policy.directives(), vec!["SET lock_timeout=1500"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub name: String,
    thresholds: Vec<Threshold>,
}

impl TimeoutPolicy {
    /// An empty policy: no directives are issued.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thresholds: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, kind: TimeoutKind, threshold: Duration) -> Self {
        self.thresholds.retain(|entry| entry.kind != kind);
        self.thresholds.push(Threshold { kind, threshold });
        self
    }

    #[must_use]
    pub fn lock(self, threshold: Duration) -> Self {
        self.with(TimeoutKind::Lock, threshold)
    }

    #[must_use]
    pub fn statement(self, threshold: Duration) -> Self {
        self.with(TimeoutKind::Statement, threshold)
    }

    #[must_use]
    pub fn idle_in_transaction(self, threshold: Duration) -> Self {
        self.with(TimeoutKind::IdleInTransaction, threshold)
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn threshold(&self, kind: TimeoutKind) -> Option<Duration> {
        self.thresholds
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| entry.threshold)
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Session directives, in the order thresholds were added.
    pub fn directives(&self) -> Vec<String> {
        self.thresholds.iter().map(Threshold::directive).collect()
    }

    /// Issues every directive on `tx`.
    ///
    /// # Errors
    ///
    /// Returns the first failing directive together with the engine's report.
    pub async fn apply(&self, tx: &mut Transaction<'_>) -> Result<(), (String, DbError)> {
        for directive in self.directives() {
            if let Err(err) = tx.execute(&directive, &[]).await {
                return Err((directive, err));
            }
        }
        Ok(())
    }
}
