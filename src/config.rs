//! Configuration types for lockbench.
//!
//! Settings are read from `lockbench.toml`. Every section is optional and
//! falls back to the defaults the experiments were designed around:
//!
//! - [`EngineSection`] - embedded engine (store, session ceiling, latency)
//! - [`PoolSection`] - connection pool limits
//! - [`ServerSection`] - HTTP trigger surface
//! - [`LoggingSection`] - tracing filter and output format
//! - [`ScenariosConfig`] - per-scenario task counts and thresholds

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::engine::{EngineConfig, Timeouts};
use crate::pool::PoolConfig;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// lockbench.toml configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSection,
    pub pool: PoolSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub scenarios: ScenariosConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    /// SQLite file backing table `t`. In-memory when unset.
    pub database: Option<PathBuf>,
    /// User the harness connects as.
    pub user: String,
    /// Engine-side session ceiling. `0` is unlimited.
    pub max_connections: usize,
    /// Simulated round trip per statement.
    pub latency_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            database: None,
            user: constants::DEFAULT_USER.to_string(),
            max_connections: constants::DEFAULT_MAX_CONNECTIONS,
            latency_ms: 0,
        }
    }
}

impl EngineSection {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_connections: self.max_connections,
            latency: Duration::from_millis(self.latency_ms),
            defaults: Timeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSection {
    /// `0` is unbounded.
    pub max_open: usize,
    /// `0` is unbounded.
    pub max_idle: usize,
    pub max_lifetime_ms: Option<u64>,
    pub max_idle_time_ms: Option<u64>,
    pub checkout_timeout_ms: Option<u64>,
    pub reset_on_release: bool,
}

impl Default for PoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_open: pool.max_open,
            max_idle: pool.max_idle,
            max_lifetime_ms: None,
            max_idle_time_ms: None,
            checkout_timeout_ms: None,
            reset_on_release: pool.reset_on_release,
        }
    }
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_open: self.max_open,
            max_idle: self.max_idle,
            max_lifetime: self.max_lifetime_ms.map(Duration::from_millis),
            max_idle_time: self.max_idle_time_ms.map(Duration::from_millis),
            checkout_timeout: self.checkout_timeout_ms.map(Duration::from_millis),
            reset_on_release: self.reset_on_release,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: constants::DEFAULT_PORT,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: constants::DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Which tasks of a batch hold their transaction open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldSchedule {
    /// Every task holds for the full delay.
    #[default]
    Uniform,
    /// Odd-numbered tasks hold; even-numbered tasks commit at once.
    OddTasks,
}

impl HoldSchedule {
    /// Hold time of task `task` (1-based).
    pub fn hold_for(self, task: usize, delay: Duration) -> Duration {
        match self {
            Self::Uniform => delay,
            Self::OddTasks if task % 2 == 1 => delay,
            Self::OddTasks => Duration::ZERO,
        }
    }
}

/// Settings of a timeout experiment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutScenario {
    pub tasks: usize,
    /// Threshold applied through the session directive.
    pub timeout_ms: u64,
    /// How long each task holds the row, idles, or sleeps engine-side.
    pub delay_ms: u64,
    pub schedule: HoldSchedule,
}

impl Default for TimeoutScenario {
    fn default() -> Self {
        Self {
            tasks: 2,
            timeout_ms: duration_ms(constants::DEFAULT_TIMEOUT),
            delay_ms: duration_ms(constants::DEFAULT_HOLD),
            schedule: HoldSchedule::Uniform,
        }
    }
}

impl TimeoutScenario {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaxOpenScenario {
    pub tasks: usize,
    pub max_open: usize,
    pub pause_ms: u64,
}

impl Default for MaxOpenScenario {
    fn default() -> Self {
        Self {
            tasks: 4,
            max_open: 2,
            pause_ms: duration_ms(constants::DEFAULT_PAUSE),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaxIdleScenario {
    pub tasks: usize,
    pub max_idle: usize,
    /// Batches run back to back; later batches reuse warm connections.
    pub rounds: usize,
}

impl Default for MaxIdleScenario {
    fn default() -> Self {
        Self {
            tasks: 5,
            max_idle: 5,
            rounds: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifetimeScenario {
    pub tasks: usize,
    pub max_idle: usize,
    pub max_lifetime_ms: u64,
    /// Wait between the two session samples.
    pub wait_ms: u64,
}

impl Default for LifetimeScenario {
    fn default() -> Self {
        Self {
            tasks: 10,
            max_idle: 10,
            max_lifetime_ms: 2_000,
            wait_ms: duration_ms(constants::DEFAULT_LIFETIME_WAIT),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenariosConfig {
    pub idle_in_transaction_timeout: TimeoutScenario,
    pub lock_timeout: TimeoutScenario,
    pub statement_timeout: TimeoutScenario,
    pub max_open_conns: MaxOpenScenario,
    pub max_idle_conns: MaxIdleScenario,
    pub conn_max_lifetime: LifetimeScenario,
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load configuration from lockbench.toml in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if lockbench.toml cannot be read or contains invalid TOML.
    pub fn load() -> Result<Self> {
        Self::load_from(constants::CONFIG_FILE)
    }

    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Fields have invalid types or unknown enum values
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from an explicit path, or from lockbench.toml when it exists,
    /// or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is present but cannot be loaded.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None if Path::new(constants::CONFIG_FILE).exists() => Self::load(),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails with one or more errors:
    /// - Empty engine user
    /// - Port 0
    /// - Scenarios with zero tasks or zero thresholds
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Engine
        if self.engine.user.is_empty() {
            errors.push("engine.user cannot be empty".to_string());
        }
        if self.engine.latency_ms > 1_000 {
            warnings.push(format!(
                "engine.latency_ms {} is above one second\n  \
                 Every statement pays it; timeout scenarios may behave differently",
                self.engine.latency_ms
            ));
        }

        // 2. Pool
        let pool = &self.pool;
        if pool.max_open > 0 && (pool.max_idle == 0 || pool.max_idle > pool.max_open) {
            warnings.push(format!(
                "pool.max_idle {} exceeds pool.max_open {}; it will be lowered to {}",
                pool.max_idle, pool.max_open, pool.max_open
            ));
        }
        let max_connections = self.engine.max_connections;
        if max_connections > 0 && (pool.max_open == 0 || pool.max_open > max_connections) {
            warnings.push(format!(
                "pool.max_open allows more connections than engine.max_connections ({max_connections})\n  \
                 Checkouts beyond it fail with SQLSTATE 53300"
            ));
        }
        if pool.checkout_timeout_ms == Some(0) {
            errors.push(
                "pool.checkout_timeout_ms cannot be 0. Omit it to wait indefinitely".to_string(),
            );
        }

        // 3. Server
        if self.server.port == 0 {
            errors.push(
                "Server port cannot be 0. Use a valid port number (1-65535)\n  \
                 Common ports: 8080 (default), 3000, 8000"
                    .to_string(),
            );
        }
        if self.server.port < 1024 && self.server.port > 0 {
            warnings.push(format!(
                "Server port {} is a system/privileged port (< 1024)\n  \
                 Recommendation: Use ports >= 1024 (e.g., 8080, 3000, 8000) to avoid permission issues",
                self.server.port
            ));
        }

        // 4. Logging
        if let Err(err) = tracing_subscriber::EnvFilter::try_new(&self.logging.filter) {
            errors.push(format!(
                "logging.filter '{}' is invalid: {err}",
                self.logging.filter
            ));
        }

        // 5. Scenarios
        let scenarios = &self.scenarios;
        for (name, scenario) in [
            ("idle_in_transaction_timeout", &scenarios.idle_in_transaction_timeout),
            ("lock_timeout", &scenarios.lock_timeout),
            ("statement_timeout", &scenarios.statement_timeout),
        ] {
            if scenario.tasks == 0 {
                errors.push(format!("scenarios.{name}.tasks cannot be 0"));
            }
            if scenario.timeout_ms == 0 {
                errors.push(format!(
                    "scenarios.{name}.timeout_ms cannot be 0 (a zero threshold disables the timeout)"
                ));
            } else if scenario.delay_ms <= scenario.timeout_ms {
                warnings.push(format!(
                    "scenarios.{name}.delay_ms ({}) does not exceed timeout_ms ({}); \
                     the timeout will not fire",
                    scenario.delay_ms, scenario.timeout_ms
                ));
            }
        }

        let max_open = &scenarios.max_open_conns;
        if max_open.tasks == 0 || max_open.max_open == 0 {
            errors.push("scenarios.max_open_conns.tasks and max_open must be positive".to_string());
        } else if max_open.max_open >= max_open.tasks {
            warnings.push(format!(
                "scenarios.max_open_conns.max_open ({}) is not below tasks ({}); no task will wait",
                max_open.max_open, max_open.tasks
            ));
        }

        let max_idle = &scenarios.max_idle_conns;
        if max_idle.tasks == 0 || max_idle.rounds == 0 {
            errors.push("scenarios.max_idle_conns.tasks and rounds must be positive".to_string());
        }

        let lifetime = &scenarios.conn_max_lifetime;
        if lifetime.tasks == 0 {
            errors.push("scenarios.conn_max_lifetime.tasks cannot be 0".to_string());
        }
        if lifetime.max_lifetime_ms == 0 {
            errors.push("scenarios.conn_max_lifetime.max_lifetime_ms cannot be 0".to_string());
        } else if lifetime.wait_ms <= lifetime.max_lifetime_ms {
            warnings.push(format!(
                "scenarios.conn_max_lifetime.wait_ms ({}) does not exceed max_lifetime_ms ({}); \
                 connections may still be open at the second sample",
                lifetime.wait_ms, lifetime.max_lifetime_ms
            ));
        }

        // Return errors if any
        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.user, "postgres");
        assert_eq!(config.pool.max_idle, 2);
        assert_eq!(config.pool.max_open, 0);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scenarios.lock_timeout.timeout_ms, 1500);
        assert_eq!(config.scenarios.lock_timeout.delay_ms, 3000);
        assert_eq!(config.scenarios.max_open_conns.tasks, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[engine]
database = "bench.db"
user = "bench"
max_connections = 20
latency_ms = 2

[pool]
max_open = 8
max_idle = 4
max_lifetime_ms = 60000
checkout_timeout_ms = 10000
reset_on_release = false

[server]
host = "0.0.0.0"
port = 9090

[logging]
filter = "lockbench=debug"
format = "json"

[scenarios.idle_in_transaction_timeout]
timeout_ms = 1000
delay_ms = 2500
schedule = "odd_tasks"

[scenarios.conn_max_lifetime]
tasks = 6
max_lifetime_ms = 1000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.database, Some(PathBuf::from("bench.db")));
        assert_eq!(config.engine.engine_config().latency, Duration::from_millis(2));

        let pool = config.pool.pool_config();
        assert_eq!(pool.max_open, 8);
        assert_eq!(pool.max_lifetime, Some(Duration::from_secs(60)));
        assert_eq!(pool.checkout_timeout, Some(Duration::from_secs(10)));
        assert!(!pool.reset_on_release);

        assert_eq!(config.logging.format, LogFormat::Json);
        let idle = &config.scenarios.idle_in_transaction_timeout;
        assert_eq!(idle.schedule, HoldSchedule::OddTasks);
        assert_eq!(idle.tasks, 2);
        assert_eq!(config.scenarios.conn_max_lifetime.tasks, 6);
        assert_eq!(config.scenarios.conn_max_lifetime.wait_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let toml_str = r#"
[logging]
format = "xml"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml_str = r#"
[engine]
user = ""

[server]
port = 0

[scenarios.lock_timeout]
tasks = 0
timeout_ms = 0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("engine.user cannot be empty"));
        assert!(err.contains("port cannot be 0"));
        assert!(err.contains("scenarios.lock_timeout.tasks cannot be 0"));
        assert!(err.contains("scenarios.lock_timeout.timeout_ms cannot be 0"));
    }

    #[test]
    fn test_validate_warnings() {
        let toml_str = r#"
[pool]
max_open = 2
max_idle = 5

[scenarios.statement_timeout]
timeout_ms = 3000
delay_ms = 1000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let result = config.validate().unwrap();
        assert!(result.has_warnings());
        assert!(result.warnings.iter().any(|w| w.contains("pool.max_idle 5")));
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.contains("scenarios.statement_timeout.delay_ms"))
        );
    }

    #[test]
    fn test_invalid_log_filter() {
        let toml_str = r#"
[logging]
filter = "lockbench=notalevel"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hold_schedule() {
        let hold = Duration::from_secs(3);
        assert_eq!(HoldSchedule::Uniform.hold_for(2, hold), hold);
        assert_eq!(HoldSchedule::OddTasks.hold_for(1, hold), hold);
        assert_eq!(HoldSchedule::OddTasks.hold_for(2, hold), Duration::ZERO);
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmax_open = 3").unwrap();
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.pool.max_open, 3);

        let config = Config::discover(Some(file.path())).unwrap();
        assert_eq!(config.pool.max_open, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from("/nonexistent/lockbench.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
