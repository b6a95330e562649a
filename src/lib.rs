//! Harness for observing how engine-enforced session timeouts and a
//! client-side connection pool interact when concurrent transactions
//! contend for one shared row.
//!
//! The pieces, leaves first:
//!
//! - [`engine`]: embedded engine hosting table `t` with PostgreSQL timeout
//!   semantics (`lock_timeout`, `statement_timeout`,
//!   `idle_in_transaction_session_timeout`).
//! - [`pool`]: bounded connection pool (`max_open`, `max_idle`,
//!   `max_lifetime`).
//! - [`txn`]: timeout policies, the per-task executor and the outcome
//!   classifier.
//! - [`harness`]: fans out a batch of tasks and joins them.
//! - [`scenarios`]: the fixed catalog of experiments.
//! - [`server`]: HTTP trigger surface.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod harness;
pub mod logging;
pub mod pool;
pub mod scenarios;
pub mod server;
pub mod txn;

pub use error::{Error, Result};
pub use harness::{BatchReport, ConcurrencyHarness, HarnessContext};
pub use scenarios::{ScenarioKind, ScenarioReport};
