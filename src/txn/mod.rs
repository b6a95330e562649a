//! Transaction execution: timeout policies, the per-task executor and the
//! outcome classifier.

mod executor;
mod outcome;
mod policy;

#[cfg(test)]
mod tests;

pub use executor::{TaskBody, TransactionExecutor};
pub use outcome::{ExecutionOutcome, OutcomeKind, TaskError, TaskResult, classify};
pub use policy::{Threshold, TimeoutKind, TimeoutPolicy};
