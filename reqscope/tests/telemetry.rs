//! Global subscriber installation runs in its own test binary.

use reqscope::config::{ObservabilityConfig, OutputFormat};
use reqscope::errors::ConfigError;
use reqscope::record::LogLevel;
use reqscope::telemetry::init_tracing;

#[test]
fn subscriber_installs_once() {
    let config = ObservabilityConfig::default()
        .with_log_level(LogLevel::Debug)
        .with_output_format(OutputFormat::Compact);

    init_tracing(&config).unwrap();
    let second = init_tracing(&config);
    assert!(matches!(second, Err(ConfigError::Subscriber(_))));
}
