//! Tracing subscriber setup.
//!
//! Diagnostics go to stderr through `tracing`; stdout is reserved for the
//! CLI's progress display in [`crate::output`].

use crate::config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter '{directives}': {reason}")]
    Filter { directives: String, reason: String },
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// `RUST_LOG` when set and non-blank, the configured level otherwise.
pub fn build_filter(level: &str, env: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    let directives = match env {
        Some(d) if !d.trim().is_empty() => d,
        _ => level,
    };
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter {
        directives: directives.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(logging: &LoggingConfig) -> Result<(), TelemetryError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = build_filter(&logging.level, env.as_deref())?;

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Install(err.to_string()))
}
