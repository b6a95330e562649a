//! The fixed catalog of timeout and pool experiments.
//!
//! | scenario                      | tasks | pool                         | body                       |
//! |-------------------------------|-------|------------------------------|----------------------------|
//! | `idle_in_transaction_timeout` | 2     | -                            | update, idle in txn        |
//! | `lock_timeout`                | 2     | -                            | update, hold the row       |
//! | `statement_timeout`           | 2     | -                            | `pg_sleep`                 |
//! | `max_open_conns`              | 4     | `max_open = 2`               | pause                      |
//! | `max_idle_conns`              | 5 x2  | `max_idle = 5`               | no-op, sessions sampled    |
//! | `conn_max_lifetime`           | 10    | `max_idle = 10`, lifetime 2s | no-op, sampled around wait |
//!
//! Pool adjustments last for one run; the context restores the configured
//! limits afterwards.

mod bodies;

pub use bodies::{EngineSleep, Noop, Pause, UpdateAndHold};

use crate::error::{Error, Result};
use crate::harness::{BatchReport, HarnessContext};
use crate::pool::PoolStats;
use crate::txn::TimeoutPolicy;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ScenarioKind {
    IdleInTransactionTimeout,
    LockTimeout,
    StatementTimeout,
    MaxOpenConns,
    MaxIdleConns,
    ConnMaxLifetime,
}

impl ScenarioKind {
    pub const ALL: [Self; 6] = [
        Self::IdleInTransactionTimeout,
        Self::LockTimeout,
        Self::StatementTimeout,
        Self::MaxOpenConns,
        Self::MaxIdleConns,
        Self::ConnMaxLifetime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::IdleInTransactionTimeout => "idle_in_transaction_timeout",
            Self::LockTimeout => "lock_timeout",
            Self::StatementTimeout => "statement_timeout",
            Self::MaxOpenConns => "max_open_conns",
            Self::MaxIdleConns => "max_idle_conns",
            Self::ConnMaxLifetime => "conn_max_lifetime",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::IdleInTransactionTimeout => {
                "update the row, then idle inside the transaction past the idle timeout"
            },
            Self::LockTimeout => "two writers contend for the row under a lock timeout",
            Self::StatementTimeout => "an engine-side sleep outlives the statement timeout",
            Self::MaxOpenConns => "more tasks than max_open; the surplus waits at checkout",
            Self::MaxIdleConns => "warm connections are kept and reused across batches",
            Self::ConnMaxLifetime => "idle connections are closed once past their lifetime",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = Error;

    /// Accepts scenario names and the legacy `gorm_*` route names.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim_matches('/');
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .or(match name {
                "gorm_set_max_open_conns" => Some(Self::MaxOpenConns),
                "gorm_set_max_idle_conns" => Some(Self::MaxIdleConns),
                "gorm_conn_max_life_time" => Some(Self::ConnMaxLifetime),
                _ => None,
            })
            .ok_or_else(|| Error::unknown_scenario(s))
    }
}

/// Session count taken during a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSample {
    pub label: String,
    pub connections: usize,
}

/// Everything a scenario run observed.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub batches: Vec<BatchReport>,
    pub samples: Vec<ConnectionSample>,
    /// Committed value of the contended row after the run.
    pub final_value: Option<i64>,
    pub pool: PoolStats,
}

impl ScenarioReport {
    fn new(scenario: ScenarioKind) -> Self {
        Self {
            scenario,
            batches: Vec::new(),
            samples: Vec::new(),
            final_value: None,
            pool: PoolStats::default(),
        }
    }

    /// Outcomes of every batch, in run order.
    pub fn outcomes(&self) -> impl Iterator<Item = &crate::txn::ExecutionOutcome> {
        self.batches.iter().flat_map(|batch| batch.outcomes.iter())
    }

    async fn sample(&mut self, ctx: &HarnessContext, label: &str) -> Result<()> {
        let connections = ctx.count_connections().await?;
        info!(label, connections, "connection");
        self.samples.push(ConnectionSample {
            label: label.to_string(),
            connections,
        });
        Ok(())
    }

    async fn finish(mut self, ctx: &HarnessContext) -> Result<Self> {
        self.final_value = ctx.current_value().await?;
        self.pool = ctx.pool().stats();
        Ok(self)
    }
}

/// Runs one scenario on `ctx`. Callers go through
/// [`HarnessContext::invoke`], which serializes runs and restores the pool.
pub(crate) async fn run(ctx: &HarnessContext, kind: ScenarioKind) -> Result<ScenarioReport> {
    info!(scenario = %kind, "scenario started");
    let scenarios = &ctx.config().scenarios;
    let harness = ctx.harness();
    let mut report = ScenarioReport::new(kind);

    match kind {
        ScenarioKind::IdleInTransactionTimeout => {
            let cfg = &scenarios.idle_in_transaction_timeout;
            let policy = TimeoutPolicy::named(kind.name()).idle_in_transaction(cfg.timeout());
            let body = Arc::new(UpdateAndHold {
                delay: cfg.delay(),
                schedule: cfg.schedule,
            });
            report
                .batches
                .push(harness.run_batch(cfg.tasks, policy, body).await?);
        },
        ScenarioKind::LockTimeout => {
            let cfg = &scenarios.lock_timeout;
            let policy = TimeoutPolicy::named(kind.name()).lock(cfg.timeout());
            let body = Arc::new(UpdateAndHold {
                delay: cfg.delay(),
                schedule: cfg.schedule,
            });
            report
                .batches
                .push(harness.run_batch(cfg.tasks, policy, body).await?);
        },
        ScenarioKind::StatementTimeout => {
            let cfg = &scenarios.statement_timeout;
            let policy = TimeoutPolicy::named(kind.name()).statement(cfg.timeout());
            let body = Arc::new(EngineSleep {
                duration: cfg.delay(),
            });
            report
                .batches
                .push(harness.run_batch(cfg.tasks, policy, body).await?);
        },
        ScenarioKind::MaxOpenConns => {
            let cfg = &scenarios.max_open_conns;
            ctx.pool().set_max_open(cfg.max_open);
            let body = Arc::new(Pause {
                duration: Duration::from_millis(cfg.pause_ms),
            });
            report.batches.push(
                harness
                    .run_batch(cfg.tasks, TimeoutPolicy::named(kind.name()), body)
                    .await?,
            );
        },
        ScenarioKind::MaxIdleConns => {
            let cfg = &scenarios.max_idle_conns;
            ctx.pool().set_max_idle(cfg.max_idle);
            report.sample(ctx, "before").await?;
            for round in 1..=cfg.rounds {
                report.batches.push(
                    harness
                        .run_batch(cfg.tasks, TimeoutPolicy::named(kind.name()), Arc::new(Noop))
                        .await?,
                );
                report.sample(ctx, &format!("after batch {round}")).await?;
            }
        },
        ScenarioKind::ConnMaxLifetime => {
            let cfg = &scenarios.conn_max_lifetime;
            ctx.pool().set_max_idle(cfg.max_idle);
            ctx.pool()
                .set_max_lifetime(Some(Duration::from_millis(cfg.max_lifetime_ms)));
            report.batches.push(
                harness
                    .run_batch(cfg.tasks, TimeoutPolicy::named(kind.name()), Arc::new(Noop))
                    .await?,
            );
            report.sample(ctx, "after batch").await?;
            tokio::time::sleep(Duration::from_millis(cfg.wait_ms)).await;
            report.sample(ctx, "after wait").await?;
        },
    }

    let report = report.finish(ctx).await?;
    info!(scenario = %kind, final_value = ?report.final_value, "scenario finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.name().parse::<ScenarioKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_route_style_names() {
        assert_eq!(
            "/lock_timeout/".parse::<ScenarioKind>().unwrap(),
            ScenarioKind::LockTimeout
        );
        assert_eq!(
            "gorm_conn_max_life_time".parse::<ScenarioKind>().unwrap(),
            ScenarioKind::ConnMaxLifetime
        );
        let err = "deadlock".parse::<ScenarioKind>().unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_clap_value_names_match() {
        use clap::ValueEnum;
        for kind in ScenarioKind::ALL {
            let value = kind.to_possible_value().unwrap();
            assert_eq!(value.get_name(), kind.name());
        }
    }
}
