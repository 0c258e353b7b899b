//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ObservabilityConfig, OutputFormat};
use crate::errors::ConfigError;

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()))
}

/// Installs the global subscriber in the configured output format.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ConfigError> {
    let filter = env_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.output_format {
        OutputFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init(),
        OutputFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        OutputFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };

    result.map_err(|e| ConfigError::Subscriber(e.to_string()))?;
    tracing::debug!(
        level = %config.log_level,
        format = %config.output_format,
        "Tracing subscriber installed"
    );
    Ok(())
}
