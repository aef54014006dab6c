//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::error::{ConkitError, Result};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter for `config`. `RUST_LOG` takes precedence over the
/// configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConkitError::Logging(format!("invalid filter '{}': {}", config.level, e)))
}

/// Install the global tracing subscriber.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(config.ansi)
                .with_target(config.with_target),
        )
        .try_init();

    if installed.is_err() {
        debug!("global tracing subscriber already installed");
    }
    Ok(())
}
