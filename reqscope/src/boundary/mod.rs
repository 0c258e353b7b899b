//! Reusable execution templates for layer boundaries.
//!
//! [`BoundaryService`] standardizes "log inbound, execute, log outbound" for
//! business-logic call sites. [`BoundaryExternalClient`] adds timeouts,
//! retries with backoff and a [`CircuitBreaker`] for calls leaving the
//! process. Both implement [`Instrumented`], the one canonical way to wrap
//! a call.

use std::error::Error as StdError;
use std::future::Future;

use async_trait::async_trait;

use crate::errors::BoundaryError;
use crate::logger::UnifiedLogger;

pub mod circuit_breaker;
pub mod external;
pub mod service;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    CooldownMs, FailureThreshold,
};
pub use external::{BoundaryExternalClient, CallOptions};
pub use service::{BoundaryService, ExecuteOptions};

/// A layer wrapper that instruments calls crossing it.
#[async_trait]
pub trait Instrumented: Send + Sync {
    /// Logger the wrapper reports through.
    fn logger(&self) -> &UnifiedLogger;

    /// Runs `call` as the named operation with this layer's boundary
    /// logging, timing and error handling. Caller errors come back wrapped
    /// in [`BoundaryError::Layer`] with the original as `source()`.
    async fn instrument<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, BoundaryError>
    where
        T: Send,
        E: StdError + Send + Sync + 'static,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send;
}
