//! Tracing subscriber setup.

use crate::config::{LogFormat, LoggingSection};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize stdout logging.
///
/// `RUST_LOG` wins over the configured filter. Calling this twice is a
/// no-op for the second call.
pub fn init(config: &LoggingSection) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if let Err(err) = result {
        eprintln!("Warning: logging already initialized: {err}");
    }
}
