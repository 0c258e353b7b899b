//! Error types for reqscope.
//!
//! Errors fall into three groups:
//!
//! - **Caller errors**: failures of wrapped business or external functions.
//!   These always reach the caller. `BoundaryError::Layer` adds layer context
//!   but keeps the original error as its `source()`.
//! - **Coordinator internal errors**: `SinkError`, `ContextError`,
//!   `ConfigError`. Sink failures never reach the caller. The sink set
//!   absorbs them.
//! - **Circuit-breaker rejections**: `BoundaryError::CircuitOpen`, kept
//!   separate from genuine downstream failures.

use std::error::Error as StdError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error_context::error_identity;
use crate::types::Layer;

/// Boxed caller error preserved inside [`BoundaryError::Layer`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by the boundary wrappers.
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// A wrapped function failed; the original error is the `source`.
    #[error("{layer} layer operation '{operation}' failed: {source}")]
    Layer {
        /// Layer that wrapped the failure
        layer: Layer,
        /// Operation that failed
        operation: String,
        /// Identity of the original error (type + message)
        identity: String,
        /// The caller's original error
        #[source]
        source: BoxError,
    },

    /// Input validation rejected the call before it ran.
    #[error("{layer} layer operation '{operation}' rejected invalid input: {message}")]
    Validation {
        /// Layer that validated the input
        layer: Layer,
        /// Operation that was rejected
        operation: String,
        /// Validator message
        message: String,
    },

    /// An external call exceeded its deadline.
    #[error("external call '{operation}' on client '{client}' timed out after {after:?}")]
    Timeout {
        /// External client name
        client: String,
        /// Operation that timed out
        operation: String,
        /// Configured deadline
        after: Duration,
    },

    /// The client's circuit breaker is open; the call was not attempted.
    #[error("circuit breaker for client '{client}' is open since {open_since}")]
    CircuitOpen {
        /// External client name
        client: String,
        /// When the breaker opened
        open_since: DateTime<Utc>,
        /// Consecutive failures that opened it
        consecutive_failures: u32,
    },
}

impl BoundaryError {
    /// Wraps a caller error with layer context.
    pub fn layer<E>(layer: Layer, operation: impl Into<String>, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Layer {
            layer,
            operation: operation.into(),
            identity: error_identity(&error),
            source: Box::new(error),
        }
    }

    /// Identity used for cascade suppression.
    ///
    /// A wrapped error reports the identity of the error it wraps, so the
    /// same failure seen at several layers is recognised as one.
    pub fn identity(&self) -> String {
        match self {
            Self::Layer { identity, .. } => identity.clone(),
            Self::Validation { message, .. } => format!("ValidationError: {message}"),
            Self::Timeout {
                client, operation, ..
            } => format!("TimeoutError: {client}.{operation}"),
            Self::CircuitOpen { client, .. } => format!("CircuitOpenError: {client}"),
        }
    }

    /// Returns the original caller error if it is of type `E`.
    pub fn downcast_source<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Layer { source, .. } => source.downcast_ref::<E>().or_else(|| {
                source
                    .downcast_ref::<Self>()
                    .and_then(Self::downcast_source::<E>)
            }),
            _ => None,
        }
    }

    /// Unwraps to the original caller error, if this is a wrapped failure.
    pub fn into_source(self) -> Result<BoxError, Self> {
        match self {
            Self::Layer { source, .. } => Ok(source),
            other => Err(other),
        }
    }

    /// Returns true if the breaker rejected the call.
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns true if the call timed out.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised by sinks. Never propagated to callers of the logger.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing to the underlying target failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be rendered.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The async buffer is full; the record was not queued.
    #[error("Sink buffer is full (capacity {capacity})")]
    BufferFull {
        /// Buffer capacity
        capacity: usize,
    },

    /// The sink has been shut down.
    #[error("Sink '{0}' is closed")]
    Closed(String),

    /// The rotating log file could not be set up.
    #[error("Log rotation error: {0}")]
    Rotation(String),

    /// A remote collector rejected or failed to receive a batch.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The sink needs a tokio runtime and none is running.
    #[error("No tokio runtime available for sink '{0}'")]
    NoRuntime(String),
}

/// Errors raised when manipulating a request context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Adding the attribute would exceed the aggregate size cap.
    #[error("Attribute '{key}' would exceed the {limit} byte attribute limit")]
    AttributeLimitExceeded {
        /// Attribute key
        key: String,
        /// Configured limit in bytes
        limit: usize,
    },

    /// A business tag failed validation.
    #[error("Invalid value for tag '{tag}': {reason}")]
    InvalidTag {
        /// Tag name
        tag: String,
        /// Validation failure
        reason: String,
    },

    /// An async task tried to start a request outside a request scope.
    #[error("No request scope in this task; run the request inside Coordinator::scope")]
    Unscoped,
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value could not be parsed or is out of range.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Configuration key
        key: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// The tracing subscriber could not be installed.
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("database unreachable")]
    struct DbError;

    #[test]
    fn layer_error_preserves_source() {
        let err = BoundaryError::layer(Layer::Service, "load", DbError);
        assert!(err.downcast_source::<DbError>().is_some());
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("database unreachable"));
        assert!(err.to_string().contains("service layer operation 'load'"));
    }

    #[test]
    fn nested_layer_errors_keep_root_identity() {
        let inner = BoundaryError::layer(Layer::Domain, "load", DbError);
        let inner_identity = inner.identity();
        let outer = BoundaryError::layer(Layer::Service, "handle", inner);
        assert_eq!(outer.identity(), inner_identity);
        assert!(outer.downcast_source::<DbError>().is_some());
    }

    #[test]
    fn into_source_returns_original() {
        let err = BoundaryError::layer(Layer::Api, "get", DbError);
        let source = err.into_source().unwrap();
        assert!(source.downcast_ref::<DbError>().is_some());
    }

    #[test]
    fn circuit_open_is_distinct() {
        let err = BoundaryError::CircuitOpen {
            client: "llm".to_string(),
            open_since: Utc::now(),
            consecutive_failures: 3,
        };
        assert!(err.is_circuit_open());
        assert!(!err.is_timeout());
        assert!(err.downcast_source::<DbError>().is_none());
    }
}
