//! Logging setup from configuration.
//!
//! Installs a global tracing subscriber honoring the configured level
//! and format. `RUST_LOG` overrides the configured level when set.

use tracing_subscriber::EnvFilter;

use crate::domain::models::config::LoggingConfig;

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops (the first subscriber wins).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = if config.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
