//! Structured records handed to sinks.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::Level;

use crate::context::RequestContext;
use crate::errors::ConfigError;
use crate::types::{Category, CorrelationId, Layer, OperationKey};

/// Severity of a record. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very detailed diagnostics
    Trace,
    /// Debugging information
    Debug,
    /// Normal operation
    Info,
    /// Something unexpected but recoverable
    Warn,
    /// A failure
    Error,
}

impl LogLevel {
    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ConfigError::invalid(
                "log_level",
                s,
                "expected trace, debug, info, warn or error",
            )),
        }
    }
}

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Inbound or outbound edge of a layer
    Boundary,
    /// Completion of a timed operation
    Operation,
    /// Completion of an external call
    ExternalCall,
    /// One-shot metric sample
    Metric,
    /// Detailed error report
    Error,
    /// Free-form event
    Event,
    /// End-of-request summary
    Summary,
}

impl From<Category> for RecordKind {
    fn from(category: Category) -> Self {
        match category {
            Category::Boundary => Self::Boundary,
            Category::Operation => Self::Operation,
            Category::ExternalCall => Self::ExternalCall,
            Category::Metric => Self::Metric,
        }
    }
}

impl RecordKind {
    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::Operation => "operation",
            Self::ExternalCall => "external_call",
            Self::Metric => "metric",
            Self::Error => "error",
            Self::Event => "event",
            Self::Summary => "summary",
        }
    }
}

/// Structured record with a consistent shape across sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Severity
    pub level: LogLevel,
    /// What the record describes
    pub kind: RecordKind,
    /// Human-readable message
    pub message: String,
    /// When the record was created
    pub timestamp: DateTime<Utc>,
    /// Name of the emitting logger
    pub logger: String,
    /// Layer of the emitting logger
    pub layer: Layer,
    /// Operation key, if the record belongs to an operation
    pub key: Option<OperationKey>,
    /// Request correlation, absent outside a request
    pub correlation_id: Option<CorrelationId>,
    /// Session tag
    pub session_id: Option<String>,
    /// User tag
    pub user_id: Option<String>,
    /// Investigation tag
    pub investigation_id: Option<String>,
    /// Phase tag
    pub phase: Option<String>,
    /// Free-form structured fields
    pub fields: Map<String, Value>,
    /// Error message, if any
    pub error: Option<String>,
    /// Error identity (type name and message), if any
    pub error_type: Option<String>,
    /// Measured duration, if any
    pub duration: Option<Duration>,
    /// Whether the duration exceeded the layer budget
    pub performance_violation: Option<bool>,
    /// Emitted through a context that had already been finalized
    pub orphaned: bool,
}

impl LogRecord {
    /// Creates a record with no request correlation attached.
    pub fn new(
        level: LogLevel,
        kind: RecordKind,
        message: impl Into<String>,
        logger: &str,
        layer: &Layer,
    ) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            logger: logger.to_string(),
            layer: layer.clone(),
            key: None,
            correlation_id: None,
            session_id: None,
            user_id: None,
            investigation_id: None,
            phase: None,
            fields: Map::new(),
            error: None,
            error_type: None,
            duration: None,
            performance_violation: None,
            orphaned: false,
        }
    }

    /// Copies correlation and business tags from a request context.
    #[must_use]
    pub fn with_context(mut self, ctx: &RequestContext) -> Self {
        self.correlation_id = Some(ctx.correlation_id());
        self.session_id = ctx.session_id().map(ToString::to_string);
        self.user_id = ctx.user_id().map(ToString::to_string);
        self.investigation_id = ctx.investigation_id().map(ToString::to_string);
        self.phase = ctx.phase().map(ToString::to_string);
        self.orphaned = ctx.is_finalized();
        self
    }

    /// Sets the operation key
    #[must_use]
    pub fn with_key(mut self, key: OperationKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Adds a field to the record
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Merges a JSON object into the fields; other values land under `value`.
    #[must_use]
    pub fn with_fields(mut self, fields: Value) -> Self {
        match fields {
            Value::Object(map) => self.fields.extend(map),
            Value::Null => {}
            other => {
                self.fields.insert("value".to_string(), other);
            }
        }
        self
    }

    /// Adds error information
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>, identity: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self.error_type = Some(identity.into());
        self
    }

    /// Adds duration information
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Flags whether the duration broke the layer budget
    #[must_use]
    pub const fn with_violation(mut self, exceeded: bool) -> Self {
        self.performance_violation = Some(exceeded);
        self
    }

    /// Converts to JSON for structured output
    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "level": self.level.as_str(),
            "kind": self.kind.as_str(),
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "logger": self.logger,
            "layer": self.layer.as_str(),
            "fields": self.fields,
        });

        let optional = [
            ("key", self.key.as_ref().map(|k| json!(k.as_str()))),
            (
                "correlation_id",
                self.correlation_id.map(|id| json!(id.to_string())),
            ),
            ("session_id", self.session_id.as_ref().map(|v| json!(v))),
            ("user_id", self.user_id.as_ref().map(|v| json!(v))),
            (
                "investigation_id",
                self.investigation_id.as_ref().map(|v| json!(v)),
            ),
            ("phase", self.phase.as_ref().map(|v| json!(v))),
            ("error", self.error.as_ref().map(|v| json!(v))),
            ("error_type", self.error_type.as_ref().map(|v| json!(v))),
            (
                "duration_ms",
                self.duration.map(|d| json!(d.as_secs_f64() * 1000.0)),
            ),
            (
                "performance_violation",
                self.performance_violation.map(|v| json!(v)),
            ),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                obj[name] = value;
            }
        }
        if self.orphaned {
            obj["orphaned"] = json!(true);
        }

        obj
    }

    /// Looks up a field by name.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warn);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn json_shape_omits_absent_fields() {
        let record = LogRecord::new(
            LogLevel::Info,
            RecordKind::Operation,
            "fetch completed",
            "orders",
            &Layer::Service,
        )
        .with_key(OperationKey::operation(
            &Layer::Service,
            Category::Operation,
            "fetch",
        ))
        .with_duration(Duration::from_millis(12))
        .with_violation(false)
        .with_fields(json!({"rows": 3}));

        let json = record.to_json();
        assert_eq!(json["level"], "info");
        assert_eq!(json["kind"], "operation");
        assert_eq!(json["layer"], "service");
        assert_eq!(json["key"], "service.operation.fetch");
        assert_eq!(json["fields"]["rows"], 3);
        assert_eq!(json["performance_violation"], false);
        assert!(json.get("correlation_id").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("orphaned").is_none());
    }

    #[test]
    fn non_object_fields_are_wrapped() {
        let record = LogRecord::new(
            LogLevel::Debug,
            RecordKind::Event,
            "note",
            "t",
            &Layer::Api,
        )
        .with_fields(json!([1, 2]));
        assert_eq!(record.field("value"), Some(&json!([1, 2])));
    }
}
