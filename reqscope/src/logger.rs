//! The per-layer logging facade used by business code.
//!
//! A [`UnifiedLogger`] is bound to a `(name, layer)` pair. Every record it
//! emits picks up the active request's correlation id and tags, and every
//! operation it times feeds that request's performance tracker, error
//! context and dedup ledger. Outside a request it still logs, just without
//! dedup or correlation.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{Instrument, Span};

use crate::config::ObservabilityConfig;
use crate::context::{self, InFlight, RequestContext};
use crate::error_context::error_identity;
use crate::performance::TimingCheck;
use crate::record::{LogLevel, LogRecord, RecordKind};
use crate::sink::SinkSet;
use crate::types::{Category, Direction, Layer, OperationKey};

/// Logging facade bound to one caller and layer.
#[derive(Clone)]
pub struct UnifiedLogger {
    name: Arc<str>,
    layer: Layer,
    sinks: Arc<SinkSet>,
    config: Arc<ObservabilityConfig>,
}

impl UnifiedLogger {
    /// Creates a logger writing to `sinks`.
    pub fn new(
        name: impl Into<String>,
        layer: impl Into<Layer>,
        sinks: Arc<SinkSet>,
        config: Arc<ObservabilityConfig>,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            layer: layer.into(),
            sinks,
            config,
        }
    }

    /// Name of the caller this logger belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layer this logger is bound to.
    pub const fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ObservabilityConfig {
        &self.config
    }

    /// Logs the edge of an operation crossing this layer.
    ///
    /// Within a request each boundary key is logged according to the dedup
    /// policy; a suppressed call is a silent no-op. Returns whether a record
    /// was emitted.
    pub fn log_boundary(&self, operation: &str, direction: Direction, fields: Value) -> bool {
        let key = OperationKey::boundary(&self.layer, operation, direction);
        let ctx = context::current();
        if let Some(ctx) = &ctx {
            if !ctx.mark_logged(key.as_str()) {
                tracing::trace!(key = %key, "Boundary already logged in this request");
                return false;
            }
        }

        let record = self
            .record(
                LogLevel::Info,
                RecordKind::Boundary,
                format!("{} {direction} {operation}", self.layer),
            )
            .with_key(key)
            .with_field("operation", json!(operation))
            .with_field("direction", json!(direction.as_str()))
            .with_fields(fields);
        self.emit(ctx.as_ref(), record, true);
        true
    }

    /// Starts timing an operation; finish it with
    /// [`OperationGuard::succeed`] or [`OperationGuard::fail`].
    pub fn start_operation(&self, name: &str) -> OperationGuard {
        self.start_category(Category::Operation, name)
    }

    pub(crate) fn start_category(&self, category: Category, name: &str) -> OperationGuard {
        let ctx = context::current();
        let key = OperationKey::operation(&self.layer, category, name);

        let span = if self.config.tracing_enabled {
            let span = tracing::info_span!(
                "operation",
                operation = name,
                layer = self.layer.as_str(),
                key = key.as_str(),
                correlation_id = tracing::field::Empty,
            );
            if let Some(ctx) = &ctx {
                span.record("correlation_id", tracing::field::display(ctx.correlation_id()));
            }
            span
        } else {
            Span::none()
        };

        OperationGuard {
            in_flight: ctx.as_ref().map(RequestContext::begin_work),
            logger: self.clone(),
            ctx,
            key,
            category,
            name: name.to_string(),
            scope: OperationScope::default(),
            started: Instant::now(),
            span,
            finished: false,
        }
    }

    /// Runs `body` as a timed operation.
    ///
    /// On success the duration is classified against this layer's budget and
    /// a completion record is emitted. On failure the error is recorded in
    /// the request's error context and returned unchanged.
    pub async fn operation<T, E, F, Fut>(&self, name: &str, body: F) -> Result<T, E>
    where
        F: FnOnce(OperationScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        self.operation_with_fields(name, Value::Null, body).await
    }

    /// [`operation`](Self::operation) with initial fields for the record.
    pub async fn operation_with_fields<T, E, F, Fut>(
        &self,
        name: &str,
        fields: Value,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(OperationScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        self.run_guarded(self.start_operation(name), fields, body)
            .await
    }

    pub(crate) async fn run_guarded<T, E, F, Fut>(
        &self,
        guard: OperationGuard,
        fields: Value,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(OperationScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        guard.scope.extend(fields);
        let span = guard.span.clone();
        let result = body(guard.scope()).instrument(span).await;
        match &result {
            Ok(_) => {
                guard.succeed();
            }
            Err(error) => {
                guard.fail(error);
            }
        }
        result
    }

    /// Emits a one-shot metric sample. Samples are never deduplicated.
    ///
    /// Returns false when metrics are disabled.
    pub fn log_metric(&self, name: &str, value: f64, unit: &str, tags: Value) -> bool {
        if !self.config.metrics_enabled {
            return false;
        }
        let ctx = context::current();
        let record = self
            .record(LogLevel::Info, RecordKind::Metric, format!("metric {name}"))
            .with_key(OperationKey::metric(&self.layer, name))
            .with_field("metric", json!(name))
            .with_field("value", json!(value))
            .with_field("unit", json!(unit))
            .with_field("tags", tags);
        self.emit(ctx.as_ref(), record, false);
        true
    }

    /// Emits a free-form record carrying the request correlation.
    pub fn event(&self, level: LogLevel, message: impl Into<String>, fields: Value) {
        if !self.sinks.enabled(level) {
            return;
        }
        let ctx = context::current();
        let record = self
            .record(level, RecordKind::Event, message)
            .with_fields(fields);
        self.emit(ctx.as_ref(), record, false);
    }

    /// Emits an info event
    pub fn info(&self, message: impl Into<String>, fields: Value) {
        self.event(LogLevel::Info, message, fields);
    }

    /// Emits a warning event
    pub fn warn(&self, message: impl Into<String>, fields: Value) {
        self.event(LogLevel::Warn, message, fields);
    }

    /// Emits an error event
    pub fn error(&self, message: impl Into<String>, fields: Value) {
        self.event(LogLevel::Error, message, fields);
    }

    fn record(&self, level: LogLevel, kind: RecordKind, message: impl Into<String>) -> LogRecord {
        LogRecord::new(level, kind, message, &self.name, &self.layer)
    }

    /// Attaches request correlation, updates counters and dispatches.
    fn emit(&self, ctx: Option<&RequestContext>, mut record: LogRecord, counts: bool) {
        if let Some(ctx) = ctx {
            record = record.with_context(ctx);
            if counts {
                ctx.count_operation();
            }
            if record.orphaned {
                ctx.count_orphan();
                tracing::debug!(
                    correlation_id = %ctx.correlation_id(),
                    message = %record.message,
                    "Record emitted after request end"
                );
            }
        }
        self.sinks.dispatch(&record);
    }
}

impl fmt::Debug for UnifiedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedLogger")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

/// Mutable field bag handed to an operation body. Clones share fields.
#[derive(Debug, Clone, Default)]
pub struct OperationScope(Arc<Mutex<Map<String, Value>>>);

impl OperationScope {
    /// Adds or replaces a field on the completion record.
    pub fn record(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.lock().insert(key.into(), value.into());
    }

    /// One field.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    /// Snapshot of every field.
    pub fn fields(&self) -> Map<String, Value> {
        self.0.lock().clone()
    }

    fn extend(&self, fields: Value) {
        match fields {
            Value::Object(map) => self.0.lock().extend(map),
            Value::Null => {}
            other => {
                self.0.lock().insert("value".to_string(), other);
            }
        }
    }
}

enum Outcome {
    Success,
    Failure { message: String, identity: String },
    Cancelled,
}

impl Outcome {
    const fn status(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A running operation. Completes once, on `succeed`, `fail` or drop.
///
/// Dropping an unfinished guard, for example when the surrounding future is
/// cancelled, emits a `cancelled` completion record.
#[must_use = "an operation guard records its outcome when finished or dropped"]
pub struct OperationGuard {
    logger: UnifiedLogger,
    ctx: Option<RequestContext>,
    key: OperationKey,
    category: Category,
    name: String,
    scope: OperationScope,
    started: Instant,
    span: Span,
    in_flight: Option<InFlight>,
    finished: bool,
}

impl OperationGuard {
    /// Operation key this guard reports under.
    pub const fn key(&self) -> &OperationKey {
        &self.key
    }

    /// The tracing span wrapping the operation; disabled when tracing is off.
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Adds a field to the completion record.
    pub fn record(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.scope.record(key, value);
    }

    /// Shared handle to the field bag.
    pub fn scope(&self) -> OperationScope {
        self.scope.clone()
    }

    /// Completes the operation successfully.
    pub fn succeed(mut self) -> TimingCheck {
        self.complete(Outcome::Success)
    }

    /// Completes the operation with a failure. The error is only inspected,
    /// never consumed.
    pub fn fail<E>(mut self, error: &E) -> TimingCheck
    where
        E: StdError + 'static,
    {
        self.complete(Outcome::Failure {
            message: error.to_string(),
            identity: error_identity(error),
        })
    }

    fn complete(&mut self, outcome: Outcome) -> TimingCheck {
        self.finished = true;
        let duration = self.started.elapsed();
        let layer = self.logger.layer.as_str();

        let check = match &self.ctx {
            Some(ctx) => ctx.performance().record_timing(layer, &self.name, duration),
            None => self.logger.config.thresholds.check(layer, duration),
        };

        if let Outcome::Failure { message, identity } = &outcome {
            let detailed = self.ctx.as_ref().map_or(true, |ctx| {
                ctx.errors().add_layer_identity(layer, identity);
                ctx.errors().should_log_identity(layer, identity)
            });
            if detailed {
                let record = self
                    .logger
                    .record(
                        LogLevel::Error,
                        RecordKind::Error,
                        format!("{} failed: {message}", self.name),
                    )
                    .with_key(self.key.clone())
                    .with_field("operation", json!(self.name))
                    .with_error(message.clone(), identity.clone())
                    .with_duration(duration)
                    .with_fields(Value::Object(self.scope.fields()));
                self.logger.emit(self.ctx.as_ref(), record, false);
            }
        }

        let allowed = self
            .ctx
            .as_ref()
            .map_or(true, |ctx| ctx.mark_logged(self.key.as_str()));
        if allowed {
            let level = match &outcome {
                Outcome::Success if check.exceeds_threshold => LogLevel::Warn,
                Outcome::Success => LogLevel::Info,
                Outcome::Failure { .. } | Outcome::Cancelled => LogLevel::Warn,
            };
            let mut record = self
                .logger
                .record(
                    level,
                    RecordKind::from(self.category),
                    format!("{} {}", self.name, outcome.status()),
                )
                .with_key(self.key.clone())
                .with_duration(duration)
                .with_violation(check.exceeds_threshold)
                .with_fields(Value::Object(self.scope.fields()))
                .with_field("operation", json!(self.name))
                .with_field("status", json!(outcome.status()))
                .with_field(
                    "threshold_ms",
                    json!(check.threshold.as_secs_f64() * 1000.0),
                );
            if let Outcome::Failure { message, identity } = outcome {
                record = record.with_error(message, identity);
            }
            self.logger.emit(self.ctx.as_ref(), record, true);
        }

        // Released last so end_request waits for the records above.
        self.in_flight.take();
        check
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(Outcome::Cancelled);
        }
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("key", &self.key)
            .field("elapsed", &self.started.elapsed())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{scope, RequestFields};
    use crate::sink::MemorySink;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    #[error("row not found")]
    struct NotFound;

    fn logger_with(layer: Layer, config: ObservabilityConfig) -> (UnifiedLogger, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let sinks = Arc::new(SinkSet::new(LogLevel::Trace).with_sink(memory.clone()));
        (
            UnifiedLogger::new("test", layer, sinks, Arc::new(config)),
            memory,
        )
    }

    fn begin_request(logger: &UnifiedLogger) -> RequestContext {
        let ctx = RequestContext::new(RequestFields::new(), logger.config());
        context::install(&ctx).unwrap();
        ctx
    }

    #[tokio::test]
    async fn boundary_logged_once_per_request() {
        let (logger, memory) = logger_with(Layer::Api, ObservabilityConfig::default());
        scope(async {
            let ctx = begin_request(&logger);
            assert!(logger.log_boundary("get_user", Direction::Inbound, json!({"id": 7})));
            assert!(!logger.log_boundary("get_user", Direction::Inbound, Value::Null));
            assert!(logger.log_boundary("get_user", Direction::Outbound, Value::Null));
            assert_eq!(ctx.operations_logged(), 2);
        })
        .await;

        let records = memory.records_with_key("api.boundary.get_user.inbound");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("id"), Some(&json!(7)));
        assert!(records[0].correlation_id.is_some());
    }

    #[test]
    fn boundary_without_request_always_logs() {
        let (logger, memory) = logger_with(Layer::Api, ObservabilityConfig::default());
        assert!(logger.log_boundary("ping", Direction::Inbound, Value::Null));
        assert!(logger.log_boundary("ping", Direction::Inbound, Value::Null));
        assert_eq!(memory.len(), 2);
        assert!(memory.records()[0].correlation_id.is_none());
    }

    #[tokio::test]
    async fn slow_operation_is_flagged() {
        let config =
            ObservabilityConfig::default().with_threshold(&Layer::Domain, Duration::from_millis(5));
        let (logger, memory) = logger_with(Layer::Domain, config);

        scope(async {
            let ctx = begin_request(&logger);
            let value = logger
                .operation("compute", |scope| async move {
                    scope.record("rows", 3);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, NotFound>(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
            assert_eq!(ctx.performance().violation_count(), 1);
        })
        .await;

        let records = memory.records_with_key("domain.operation.compute");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].performance_violation, Some(true));
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].field("rows"), Some(&json!(3)));
        assert_eq!(records[0].field("status"), Some(&json!("success")));
    }

    #[tokio::test]
    async fn errors_propagate_and_are_detailed_once() {
        let (domain, memory) = logger_with(Layer::Domain, ObservabilityConfig::default());
        let service = UnifiedLogger::new(
            "svc",
            Layer::Service,
            Arc::clone(&domain.sinks),
            Arc::clone(&domain.config),
        );

        scope(async {
            let ctx = begin_request(&domain);
            let outer = service
                .operation("load", |_| async {
                    domain
                        .operation("fetch", |_| async { Err::<(), _>(NotFound) })
                        .await
                })
                .await;
            assert_eq!(outer, Err(NotFound));
            assert_eq!(ctx.errors().error_count(), 2);
        })
        .await;

        assert_eq!(memory.records_of_kind(RecordKind::Error).len(), 1);
        let completions = memory.records_of_kind(RecordKind::Operation);
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|r| r.error_type.as_deref() == Some("NotFound: row not found")));
    }

    #[tokio::test]
    async fn dropped_guard_reports_cancellation() {
        let (logger, memory) = logger_with(Layer::Service, ObservabilityConfig::default());
        scope(async {
            let ctx = begin_request(&logger);
            let guard = logger.start_operation("slow");
            assert_eq!(ctx.in_flight(), 1);
            drop(guard);
            assert_eq!(ctx.in_flight(), 0);
        })
        .await;

        let records = memory.records_with_key("service.operation.slow");
        assert_eq!(records[0].field("status"), Some(&json!("cancelled")));
    }

    #[test]
    fn metrics_are_never_deduplicated() {
        let (logger, memory) = logger_with(Layer::Api, ObservabilityConfig::default());
        assert!(logger.log_metric("latency", 12.5, "ms", json!({"route": "/a"})));
        assert!(logger.log_metric("latency", 12.5, "ms", json!({"route": "/a"})));
        assert_eq!(memory.records_of_kind(RecordKind::Metric).len(), 2);

        let (disabled, memory) =
            logger_with(Layer::Api, ObservabilityConfig::default().with_metrics(false));
        assert!(!disabled.log_metric("latency", 1.0, "ms", Value::Null));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn operations_run_inside_spans() {
        let (logger, _memory) = logger_with(Layer::Service, ObservabilityConfig::default());
        logger
            .operation("traced", |_| async {
                tracing::info!("inside body");
                Ok::<_, NotFound>(())
            })
            .await
            .unwrap();
        assert!(logs_contain("inside body"));
        assert!(logs_contain("key=\"service.operation.traced\""));
    }
}
