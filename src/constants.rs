//! Shared constants and defaults.

use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "lockbench.toml";

/// Engine user the harness connects as.
pub const DEFAULT_USER: &str = "postgres";

/// Key of the contended row.
pub const SEED_KEY: &str = "ian";

/// Baseline value of the contended row.
pub const SEED_VALUE: i64 = 777;

/// Engine-side session ceiling.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Warm connections kept by the pool when `max_idle` is not configured.
pub const DEFAULT_MAX_IDLE: usize = 2;

pub const DEFAULT_PORT: u16 = 8080;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Threshold every timeout scenario configures.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long contended and idle transactions hold the row.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(3);

/// Engine-side delay used by the statement timeout scenario.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(3);

/// Pause of each task in the `max_open_conns` scenario.
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(5);

/// Wait between the samples of the `conn_max_lifetime` scenario.
pub const DEFAULT_LIFETIME_WAIT: Duration = Duration::from_secs(5);

/// Lower bound for the pool reaper interval.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

pub const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name VARCHAR(64) UNIQUE, num INT)";

pub const SEED: &str =
    "INSERT INTO t(name, num) VALUES ('ian', 777) ON CONFLICT(name) DO UPDATE SET num = 777";

pub const UPDATE_ROW: &str = "UPDATE t SET num=$1 WHERE name='ian'";

pub const SELECT_ROW: &str = "SELECT num FROM t WHERE name = 'ian'";

/// Session count for `user`, as reported by the activity view.
pub fn count_sessions_sql(user: &str) -> String {
    format!("SELECT count(*) FROM pg_stat_activity WHERE usename = '{user}'")
}
