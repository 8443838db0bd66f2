//! Tracing subscriber setup for processes embedding the core.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a stderr fmt subscriber filtered at the configured level.
///
/// An unparsable level falls back to `info`. Returns `false` if a global
/// subscriber was already installed.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
