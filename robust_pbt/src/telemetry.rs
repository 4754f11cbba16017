//! Logging initialization.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format {
        LogFormat::Json => init_json(filter),
        LogFormat::Text => init_text(filter),
    }
}

fn init_text(filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Console logging initialized");
    Ok(())
}

fn init_json(filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("JSON logging initialized");
    Ok(())
}
