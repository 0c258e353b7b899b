//! Business-logic boundary template.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Instrumented;
use crate::errors::BoundaryError;
use crate::logger::UnifiedLogger;
use crate::types::Direction;

type Validator<I> = Box<dyn FnOnce(&I) -> Result<(), String> + Send>;
type Transform<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Optional hooks around the wrapped call.
pub struct ExecuteOptions<I, T> {
    validate_inputs: Option<Validator<I>>,
    transform_result: Option<Transform<T>>,
}

impl<I, T> Default for ExecuteOptions<I, T> {
    fn default() -> Self {
        Self {
            validate_inputs: None,
            transform_result: None,
        }
    }
}

impl<I, T> ExecuteOptions<I, T> {
    /// Creates options with no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the call with [`BoundaryError::Validation`] when the
    /// validator returns an error message.
    #[must_use]
    pub fn validate_inputs<V>(mut self, validator: V) -> Self
    where
        V: FnOnce(&I) -> Result<(), String> + Send + 'static,
    {
        self.validate_inputs = Some(Box::new(validator));
        self
    }

    /// Maps a successful result before it is returned.
    #[must_use]
    pub fn transform_result<M>(mut self, transform: M) -> Self
    where
        M: FnOnce(T) -> T + Send + 'static,
    {
        self.transform_result = Some(Box::new(transform));
        self
    }
}

impl<I, T> fmt::Debug for ExecuteOptions<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("validate_inputs", &self.validate_inputs.is_some())
            .field("transform_result", &self.transform_result.is_some())
            .finish()
    }
}

/// Standard template for business-logic operations.
#[derive(Debug, Clone)]
pub struct BoundaryService {
    logger: UnifiedLogger,
}

impl BoundaryService {
    /// Wraps calls through `logger`.
    pub const fn new(logger: UnifiedLogger) -> Self {
        Self { logger }
    }

    /// Logs the inbound boundary, runs `func` as a timed operation and logs
    /// the outbound boundary on success.
    pub async fn execute_operation<I, T, E, F, Fut>(
        &self,
        name: &str,
        input: I,
        func: F,
    ) -> Result<T, BoundaryError>
    where
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        self.execute_operation_with(name, input, func, ExecuteOptions::default())
            .await
    }

    /// [`execute_operation`](Self::execute_operation) with validation and
    /// result-transform hooks.
    ///
    /// Failures of `func` are wrapped in [`BoundaryError::Layer`] keeping
    /// the original error as the source; they are never suppressed.
    pub async fn execute_operation_with<I, T, E, F, Fut>(
        &self,
        name: &str,
        input: I,
        func: F,
        options: ExecuteOptions<I, T>,
    ) -> Result<T, BoundaryError>
    where
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        self.logger
            .log_boundary(name, Direction::Inbound, Value::Null);

        let layer = self.logger.layer().clone();
        let ExecuteOptions {
            validate_inputs,
            transform_result,
        } = options;

        let result = self
            .logger
            .operation(name, |_scope| async move {
                if let Some(validate) = validate_inputs {
                    validate(&input).map_err(|message| BoundaryError::Validation {
                        layer: layer.clone(),
                        operation: name.to_string(),
                        message,
                    })?;
                }
                let output = func(input)
                    .await
                    .map_err(|error| BoundaryError::layer(layer, name, error))?;
                Ok(match transform_result {
                    Some(transform) => transform(output),
                    None => output,
                })
            })
            .await;

        if result.is_ok() {
            self.logger
                .log_boundary(name, Direction::Outbound, json!({"status": "success"}));
        }
        result
    }
}

#[async_trait]
impl Instrumented for BoundaryService {
    fn logger(&self) -> &UnifiedLogger {
        &self.logger
    }

    async fn instrument<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, BoundaryError>
    where
        T: Send,
        E: StdError + Send + Sync + 'static,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.execute_operation(operation, (), move |()| call()).await
    }
}
