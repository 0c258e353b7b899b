//! Configuration for the coordinator, with validated bounds.
//!
//! Bounded numeric settings are `nutype` newtypes, so an out-of-range value
//! cannot be constructed. [`ObservabilityConfig::from_env`] reads the
//! `REQSCOPE_*` environment variables; anything unset keeps its default.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::boundary::circuit_breaker::{CircuitBreakerConfig, CooldownMs, FailureThreshold};
use crate::dedup::DedupPolicy;
use crate::errors::ConfigError;
use crate::performance::PerformanceThresholds;
use crate::record::LogLevel;
use crate::types::Layer;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "REQSCOPE_";

/// Maximum number of operation keys remembered per request.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 1_000_000),
    default = 1000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxLoggedOperations(usize);

/// Aggregate byte budget for ad-hoc request attributes.
#[nutype(
    validate(greater_or_equal = 64, less_or_equal = 10_000_000),
    default = 10_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxAttributeBytes(usize);

/// Capacity of the recent-timings ring buffer.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct TimingHistory(usize);

/// Capacity of the asynchronous sink buffer.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    default = 1024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct SinkBufferSize(usize);

/// Records flushed together by the asynchronous sink buffer.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    default = 64,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Interval between timed flushes of the sink buffer.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    default = 1000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct FlushIntervalMs(u64);

impl FlushIntervalMs {
    /// Convert to Duration for use with `tokio::time::interval`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// How long `end_request` waits for in-flight operations.
#[nutype(
    validate(less_or_equal = 600_000),
    default = 2000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct FinalizeGraceMs(u64);

impl FinalizeGraceMs {
    /// Convert to Duration for use with `tokio::time::timeout`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// A per-layer budget in seconds, as read from configuration.
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 3600.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct ThresholdSecs(f64);

impl ThresholdSecs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.into_inner())
    }
}

/// Output format for console records and the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(ConfigError::invalid(
                "log_format",
                s,
                "expected json, pretty or compact",
            )),
        }
    }
}

/// Complete coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Minimum level delivered to sinks and the subscriber
    pub log_level: LogLevel,
    /// Console and subscriber output format
    pub output_format: OutputFormat,
    /// Per-layer latency budgets
    pub thresholds: PerformanceThresholds,
    /// How repeated operation keys are treated
    pub dedup_policy: DedupPolicy,
    /// Operation keys remembered per request
    pub max_logged_operations: MaxLoggedOperations,
    /// Attribute byte budget per request
    pub max_attribute_bytes: MaxAttributeBytes,
    /// Recent timings retained per request
    pub timing_history: TimingHistory,
    /// Async sink buffer capacity
    pub sink_buffer_size: SinkBufferSize,
    /// Records per async flush
    pub batch_size: BatchSize,
    /// Timed flush interval
    pub flush_interval: FlushIntervalMs,
    /// Wrap operations in tracing spans
    pub tracing_enabled: bool,
    /// Emit metric records
    pub metrics_enabled: bool,
    /// Bounded wait for in-flight work at request end
    pub finalize_grace: FinalizeGraceMs,
    /// Circuit breaker defaults for external clients
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            output_format: OutputFormat::default(),
            thresholds: PerformanceThresholds::default(),
            dedup_policy: DedupPolicy::default(),
            max_logged_operations: MaxLoggedOperations::default(),
            max_attribute_bytes: MaxAttributeBytes::default(),
            timing_history: TimingHistory::default(),
            sink_buffer_size: SinkBufferSize::default(),
            batch_size: BatchSize::default(),
            flush_interval: FlushIntervalMs::default(),
            tracing_enabled: true,
            metrics_enabled: true,
            finalize_grace: FinalizeGraceMs::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ObservabilityConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from `REQSCOPE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides from any key/value source, keyed like the
    /// environment variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let mut config = Self::default();

        if let Some((_, v)) = get("LOG_LEVEL") {
            config.log_level = v.parse()?;
        }
        if let Some((_, v)) = get("LOG_FORMAT") {
            config.output_format = v.parse()?;
        }
        for (name, layer) in [
            ("THRESHOLD_API", Layer::Api),
            ("THRESHOLD_SERVICE", Layer::Service),
            ("THRESHOLD_DOMAIN", Layer::Domain),
            ("THRESHOLD_EXTERNAL", Layer::External),
            ("THRESHOLD_DEFAULT", Layer::Other(String::new())),
        ] {
            if let Some((key, v)) = get(name) {
                let secs = parse_threshold(&key, &v)?;
                config.thresholds = config.thresholds.with_layer(&layer, secs.as_duration());
            }
        }
        if let Some((_, v)) = get("DEDUP_POLICY") {
            config.dedup_policy = v.parse()?;
        }
        if let Some((key, v)) = get("MAX_LOGGED_OPERATIONS") {
            config.max_logged_operations =
                MaxLoggedOperations::try_new(parse_number(&key, &v)?)
                    .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("MAX_ATTRIBUTE_BYTES") {
            config.max_attribute_bytes = MaxAttributeBytes::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("TIMING_HISTORY") {
            config.timing_history = TimingHistory::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("BUFFER_SIZE") {
            config.sink_buffer_size = SinkBufferSize::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("BATCH_SIZE") {
            config.batch_size = BatchSize::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("FLUSH_INTERVAL_MS") {
            config.flush_interval = FlushIntervalMs::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("FINALIZE_GRACE_MS") {
            config.finalize_grace = FinalizeGraceMs::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("TRACING_ENABLED") {
            config.tracing_enabled = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("METRICS_ENABLED") {
            config.metrics_enabled = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("BREAKER_THRESHOLD") {
            config.circuit_breaker.failure_threshold =
                FailureThreshold::try_new(parse_number(&key, &v)?)
                    .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }
        if let Some((key, v)) = get("BREAKER_COOLDOWN_MS") {
            config.circuit_breaker.cooldown = CooldownMs::try_new(parse_number(&key, &v)?)
                .map_err(|e| ConfigError::invalid(&key, &v, e))?;
        }

        Ok(config)
    }

    /// Sets the minimum log level
    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the output format
    #[must_use]
    pub const fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Replaces all layer budgets
    #[must_use]
    pub const fn with_thresholds(mut self, thresholds: PerformanceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Overrides one layer's budget
    #[must_use]
    pub fn with_threshold(mut self, layer: &Layer, threshold: Duration) -> Self {
        self.thresholds = self.thresholds.with_layer(layer, threshold);
        self
    }

    /// Sets the dedup policy
    #[must_use]
    pub const fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }

    /// Sets the per-request operation key cap
    #[must_use]
    pub const fn with_max_logged_operations(mut self, max: MaxLoggedOperations) -> Self {
        self.max_logged_operations = max;
        self
    }

    /// Sets the per-request attribute byte budget
    #[must_use]
    pub const fn with_max_attribute_bytes(mut self, max: MaxAttributeBytes) -> Self {
        self.max_attribute_bytes = max;
        self
    }

    /// Sets async buffer capacity, batch size and flush interval
    #[must_use]
    pub const fn with_buffering(
        mut self,
        buffer_size: SinkBufferSize,
        batch_size: BatchSize,
        flush_interval: FlushIntervalMs,
    ) -> Self {
        self.sink_buffer_size = buffer_size;
        self.batch_size = batch_size;
        self.flush_interval = flush_interval;
        self
    }

    /// Enables or disables tracing spans around operations
    #[must_use]
    pub const fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    /// Enables or disables metric records
    #[must_use]
    pub const fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Sets the end-of-request grace period
    #[must_use]
    pub const fn with_finalize_grace(mut self, grace: FinalizeGraceMs) -> Self {
        self.finalize_grace = grace;
        self
    }

    /// Sets the circuit breaker defaults
    #[must_use]
    pub const fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Serializable view used by the health endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "log_level": self.log_level.to_string(),
            "output_format": self.output_format.to_string(),
            "thresholds_secs": {
                "api": self.thresholds.api.as_secs_f64(),
                "service": self.thresholds.service.as_secs_f64(),
                "domain": self.thresholds.domain.as_secs_f64(),
                "external": self.thresholds.external.as_secs_f64(),
                "default": self.thresholds.fallback.as_secs_f64(),
            },
            "dedup_policy": self.dedup_policy.to_string(),
            "max_logged_operations": self.max_logged_operations.into_inner(),
            "max_attribute_bytes": self.max_attribute_bytes.into_inner(),
            "sink_buffer_size": self.sink_buffer_size.into_inner(),
            "batch_size": self.batch_size.into_inner(),
            "flush_interval_ms": self.flush_interval.into_inner(),
            "tracing_enabled": self.tracing_enabled,
            "metrics_enabled": self.metrics_enabled,
            "finalize_grace_ms": self.finalize_grace.into_inner(),
            "circuit_breaker": {
                "failure_threshold": self.circuit_breaker.failure_threshold.into_inner(),
                "cooldown_ms": self.circuit_breaker.cooldown.into_inner(),
                "enabled": self.circuit_breaker.enabled,
            },
        })
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_threshold(key: &str, value: &str) -> Result<ThresholdSecs, ConfigError> {
    ThresholdSecs::try_new(parse_number::<f64>(key, value)?)
        .map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.dedup_policy, DedupPolicy::Strict);
        assert_eq!(config.max_logged_operations.into_inner(), 1000);
        assert_eq!(config.max_attribute_bytes.into_inner(), 10_000);
        assert_eq!(config.timing_history.into_inner(), 100);
        assert_eq!(config.thresholds.api, Duration::from_millis(100));
        assert_eq!(config.thresholds.service, Duration::from_millis(500));
        assert_eq!(config.thresholds.domain, Duration::from_millis(300));
        assert_eq!(config.thresholds.external, Duration::from_secs(1));
        assert_eq!(config.circuit_breaker.failure_threshold.into_inner(), 3);
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let config = ObservabilityConfig::from_lookup(lookup(&[
            ("REQSCOPE_LOG_LEVEL", "debug"),
            ("REQSCOPE_LOG_FORMAT", "compact"),
            ("REQSCOPE_THRESHOLD_API", "0.25"),
            ("REQSCOPE_DEDUP_POLICY", "count:2"),
            ("REQSCOPE_BUFFER_SIZE", "64"),
            ("REQSCOPE_FLUSH_INTERVAL_MS", "250"),
            ("REQSCOPE_METRICS_ENABLED", "false"),
            ("REQSCOPE_BREAKER_THRESHOLD", "5"),
        ]))
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.output_format, OutputFormat::Compact);
        assert_eq!(config.thresholds.api, Duration::from_millis(250));
        assert_eq!(config.thresholds.service, Duration::from_millis(500));
        assert_eq!(config.dedup_policy, DedupPolicy::CountBased(2));
        assert_eq!(config.sink_buffer_size.into_inner(), 64);
        assert_eq!(config.flush_interval.as_duration(), Duration::from_millis(250));
        assert!(!config.metrics_enabled);
        assert_eq!(config.circuit_breaker.failure_threshold.into_inner(), 5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = ObservabilityConfig::from_lookup(lookup(&[("REQSCOPE_THRESHOLD_DOMAIN", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "REQSCOPE_THRESHOLD_DOMAIN"));

        assert!(
            ObservabilityConfig::from_lookup(lookup(&[("REQSCOPE_MAX_LOGGED_OPERATIONS", "5")]))
                .is_err()
        );
        assert!(
            ObservabilityConfig::from_lookup(lookup(&[("REQSCOPE_TRACING_ENABLED", "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn snapshot_exposes_effective_settings() {
        let config = ObservabilityConfig::new().with_dedup_policy(DedupPolicy::Disabled);
        let snapshot = config.snapshot();
        assert_eq!(snapshot["dedup_policy"], "none");
        assert_eq!(snapshot["thresholds_secs"]["api"], 0.1);
        assert_eq!(snapshot["circuit_breaker"]["failure_threshold"], 3);
    }
}
