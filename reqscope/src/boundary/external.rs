//! External-integration boundary template with timeouts, retries and a
//! circuit breaker.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::Instrumented;
use crate::errors::BoundaryError;
use crate::logger::UnifiedLogger;
use crate::types::{Category, Direction};

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Per-call options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline for each attempt
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// First backoff delay; doubles per retry
    pub backoff_base: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 0,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl CallOptions {
    /// Creates options with no timeout and no retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt deadline
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry count
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the first backoff delay
    #[must_use]
    pub const fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

/// Exponential backoff with up to 10% jitter.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2_u32.saturating_pow(attempt - 1);
    let delay = base.saturating_mul(factor).min(MAX_BACKOFF);
    let jitter = rand::rng().random_range(0.0..=0.1);
    delay + delay.mul_f64(jitter)
}

/// Wraps calls to one external dependency.
///
/// The breaker is consulted once per call, before any retry, and records
/// one outcome per call.
#[derive(Debug)]
pub struct BoundaryExternalClient {
    client: String,
    logger: UnifiedLogger,
    breaker: CircuitBreaker,
}

impl BoundaryExternalClient {
    /// Creates a client using the logger's breaker configuration.
    pub fn new(client: impl Into<String>, logger: UnifiedLogger) -> Self {
        let config = logger.config().circuit_breaker;
        Self::with_breaker(client, logger, config)
    }

    /// Creates a client with an explicit breaker configuration.
    pub fn with_breaker(
        client: impl Into<String>,
        logger: UnifiedLogger,
        config: CircuitBreakerConfig,
    ) -> Self {
        let client = client.into();
        Self {
            breaker: CircuitBreaker::new(client.clone(), config),
            client,
            logger,
        }
    }

    /// Name of the external dependency.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// The client's breaker.
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Calls the external dependency through the breaker.
    ///
    /// Each attempt is bounded by `options.timeout`; a timed-out attempt
    /// fails with [`BoundaryError::Timeout`]. Failed attempts are retried
    /// `options.retries` times with exponential backoff. An open breaker
    /// fails with [`BoundaryError::CircuitOpen`] without calling `func`.
    pub async fn call_external<T, E, F, Fut>(
        &self,
        operation: &str,
        options: CallOptions,
        mut func: F,
    ) -> Result<T, BoundaryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let permit = self.breaker.try_acquire().inspect_err(|error| {
            self.logger.warn(
                format!("{operation} rejected by open circuit breaker"),
                json!({"client": self.client, "operation": operation, "error": error.to_string()}),
            );
        })?;

        self.logger.log_boundary(
            operation,
            Direction::Inbound,
            json!({"client": self.client}),
        );

        let guard = self
            .logger
            .start_category(Category::ExternalCall, operation);
        guard.record("client", self.client.as_str());
        if permit.is_trial() {
            guard.record("breaker_trial", true);
        }

        let layer = self.logger.layer().clone();
        let client = self.client.as_str();
        let result = self
            .logger
            .run_guarded(guard, Value::Null, |scope| async move {
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    let outcome = match options.timeout {
                        Some(limit) => match tokio::time::timeout(limit, func()).await {
                            Ok(result) => {
                                result.map_err(|e| BoundaryError::layer(layer.clone(), operation, e))
                            }
                            Err(_) => Err(BoundaryError::Timeout {
                                client: client.to_string(),
                                operation: operation.to_string(),
                                after: limit,
                            }),
                        },
                        None => func()
                            .await
                            .map_err(|e| BoundaryError::layer(layer.clone(), operation, e)),
                    };

                    match outcome {
                        Ok(value) => {
                            scope.record("attempts", attempt);
                            return Ok(value);
                        }
                        Err(error) if attempt <= options.retries => {
                            let delay = backoff_delay(attempt, options.backoff_base);
                            tracing::debug!(
                                client,
                                operation,
                                attempt,
                                delay = ?delay,
                                error = %error,
                                "External call failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(error) => {
                            scope.record("attempts", attempt);
                            return Err(error);
                        }
                    }
                }
            })
            .await;

        match &result {
            Ok(_) => {
                permit.success();
                self.logger.log_boundary(
                    operation,
                    Direction::Outbound,
                    json!({"client": self.client, "status": "success"}),
                );
            }
            Err(_) => permit.failure(),
        }
        result
    }
}

#[async_trait]
impl Instrumented for BoundaryExternalClient {
    fn logger(&self) -> &UnifiedLogger {
        &self.logger
    }

    async fn instrument<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, BoundaryError>
    where
        T: Send,
        E: StdError + Send + Sync + 'static,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.call_external(operation, CallOptions::default(), call)
            .await
    }
}
