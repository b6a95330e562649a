//! Transaction bodies used by the scenarios.

use crate::config::HoldSchedule;
use crate::constants::UPDATE_ROW;
use crate::engine::Value;
use crate::pool::Transaction;
use crate::txn::TaskBody;
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Writes the task index into the contended row, then keeps the
/// transaction open for the scheduled hold time without issuing commands.
pub struct UpdateAndHold {
    pub delay: Duration,
    pub schedule: HoldSchedule,
}

#[async_trait]
impl TaskBody for UpdateAndHold {
    async fn run(&self, tx: &mut Transaction<'_>, task: usize) -> anyhow::Result<()> {
        let num = i64::try_from(task)?;
        tx.execute(UPDATE_ROW, &[Value::Integer(num)])
            .await
            .with_context(|| format!("{task}: update"))?;
        info!(task, "got lock and updated");

        let hold = self.schedule.hold_for(task, self.delay);
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        info!(task, "finish process");
        Ok(())
    }
}

/// Keeps one statement busy engine-side with `pg_sleep`.
pub struct EngineSleep {
    pub duration: Duration,
}

impl EngineSleep {
    pub fn sql(&self) -> String {
        let seconds = if self.duration.subsec_nanos() == 0 {
            self.duration.as_secs().to_string()
        } else {
            format!("{:.3}", self.duration.as_secs_f64())
        };
        format!("SELECT pg_sleep({seconds});")
    }
}

#[async_trait]
impl TaskBody for EngineSleep {
    async fn run(&self, tx: &mut Transaction<'_>, task: usize) -> anyhow::Result<()> {
        tx.execute(&self.sql(), &[])
            .await
            .with_context(|| format!("{task}: sleep"))?;
        info!(task, "finish process");
        Ok(())
    }
}

/// Holds the connection client-side without touching the row.
pub struct Pause {
    pub duration: Duration,
}

#[async_trait]
impl TaskBody for Pause {
    async fn run(&self, _tx: &mut Transaction<'_>, _task: usize) -> anyhow::Result<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Commits immediately.
pub struct Noop;

#[async_trait]
impl TaskBody for Noop {
    async fn run(&self, _tx: &mut Transaction<'_>, _task: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_sql() {
        let whole = EngineSleep {
            duration: Duration::from_secs(3),
        };
        assert_eq!(whole.sql(), "SELECT pg_sleep(3);");

        let fraction = EngineSleep {
            duration: Duration::from_millis(1500),
        };
        assert_eq!(fraction.sql(), "SELECT pg_sleep(1.500);");
    }
}
