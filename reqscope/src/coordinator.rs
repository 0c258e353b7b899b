//! Request lifecycle management.
//!
//! The [`Coordinator`] creates a [`RequestContext`] when a request starts,
//! keeps it reachable for the request's duration and finalizes it when the
//! request ends, emitting a [`RequestSummary`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ObservabilityConfig;
use crate::context::{self, RequestContext, RequestFields};
use crate::errors::{ConfigError, SinkError};
use crate::logger::UnifiedLogger;
use crate::record::{LogLevel, LogRecord, RecordKind};
use crate::sink::{BufferedSink, ConsoleSink, Sink, SinkSet};
use crate::types::{CorrelationId, Layer};

/// Snapshot of a finished request.
///
/// A summary with no correlation id is the empty summary returned when no
/// request was active.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestSummary {
    /// Correlation id of the request
    pub correlation_id: Option<CorrelationId>,
    /// Session tag, if any
    pub session_id: Option<String>,
    /// Wall time from start to end
    pub duration_seconds: f64,
    /// Boundary, operation and external-call records emitted
    pub operations_logged: usize,
    /// Error occurrences across all layers
    pub errors_encountered: usize,
    /// Timings that exceeded their layer budget
    pub performance_violations: usize,
    /// Records emitted after the request ended
    pub orphaned_records: usize,
    /// Operations still running when the summary was taken
    pub in_flight_at_close: usize,
}

impl RequestSummary {
    fn of(ctx: &RequestContext) -> Self {
        Self {
            correlation_id: Some(ctx.correlation_id()),
            session_id: ctx.session_id().map(ToString::to_string),
            duration_seconds: ctx.elapsed().as_secs_f64(),
            operations_logged: ctx.operations_logged(),
            errors_encountered: ctx.errors().error_count(),
            performance_violations: ctx.performance().violation_count(),
            orphaned_records: ctx.orphaned_records(),
            in_flight_at_close: ctx.in_flight(),
        }
    }

    /// Returns true for the no-request summary.
    pub const fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
    }
}

/// Overall observability state reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Every record reached a sink
    Healthy,
    /// Some records were dropped
    Degraded,
}

/// Read-only view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall state
    pub status: HealthState,
    /// Whether the caller is inside an active request
    pub active_context: bool,
    /// Correlation id of that request
    pub correlation_id: Option<CorrelationId>,
    /// Operations logged by that request so far
    pub operations_logged: usize,
    /// Errors recorded by that request so far
    pub errors_tracked: usize,
    /// Budget violations recorded by that request so far
    pub performance_violations: usize,
    /// Effective configuration
    pub configuration: Value,
    /// Requests started since the coordinator was built
    pub requests_started: u64,
    /// Requests ended since the coordinator was built
    pub requests_completed: u64,
    /// Records no sink could take
    pub dropped_records: u64,
}

struct CoordinatorInner {
    config: Arc<ObservabilityConfig>,
    sinks: Arc<SinkSet>,
    buffers: Vec<Arc<BufferedSink>>,
    summary_logger: UnifiedLogger,
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
}

/// Owns the configuration and sinks and manages request lifecycles.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Creates a coordinator logging to the console.
    pub fn new(config: ObservabilityConfig) -> Self {
        let sinks = SinkSet::new(config.log_level)
            .with_sink(Arc::new(ConsoleSink::new(config.output_format)));
        Self::assemble(config, sinks, Vec::new())
    }

    /// Creates a console coordinator configured from `REQSCOPE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(ObservabilityConfig::from_env()?))
    }

    /// Starts building a coordinator with custom sinks.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    fn assemble(
        config: ObservabilityConfig,
        sinks: SinkSet,
        buffers: Vec<Arc<BufferedSink>>,
    ) -> Self {
        let config = Arc::new(config);
        let sinks = Arc::new(sinks);
        let summary_logger = UnifiedLogger::new(
            "reqscope.coordinator",
            Layer::Api,
            Arc::clone(&sinks),
            Arc::clone(&config),
        );
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                sinks,
                buffers,
                summary_logger,
                requests_started: AtomicU64::new(0),
                requests_completed: AtomicU64::new(0),
            }),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ObservabilityConfig {
        &self.inner.config
    }

    /// The composed sinks.
    pub fn sinks(&self) -> &Arc<SinkSet> {
        &self.inner.sinks
    }

    /// A logger bound to `name` and `layer`.
    pub fn logger(&self, name: impl Into<String>, layer: impl Into<Layer>) -> UnifiedLogger {
        UnifiedLogger::new(
            name,
            layer,
            Arc::clone(&self.inner.sinks),
            Arc::clone(&self.inner.config),
        )
    }

    /// Creates a context for a new request and installs it as the ambient
    /// context.
    ///
    /// Calling this while another request is active replaces that request's
    /// context; this is a usage error and is logged as a warning.
    ///
    /// Async tasks must call this inside [`Coordinator::scope`]. Outside one
    /// the context is returned without being installed, so no other task on
    /// the worker thread can observe it; end it with [`Coordinator::finish`].
    pub fn start_request(&self, fields: RequestFields) -> RequestContext {
        let ctx = RequestContext::new(fields, &self.inner.config);
        match context::install(&ctx) {
            Ok(Some(previous)) if !previous.is_finalized() => {
                tracing::warn!(
                    previous = %previous.correlation_id(),
                    replacement = %ctx.correlation_id(),
                    "start_request called while a request was active; replacing its context"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id(),
                    error = %error,
                    "Request context not installed"
                );
            }
        }

        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            correlation_id = %ctx.correlation_id(),
            session_id = ?ctx.session_id(),
            "Request started"
        );
        ctx
    }

    /// Ends the active request and returns its summary.
    ///
    /// Waits up to the configured grace period for operations still in
    /// flight. With no active request this returns an empty summary.
    ///
    /// The context stays current while the grace period runs, so late
    /// operations of the request still correlate and deduplicate.
    pub async fn end_request(&self) -> RequestSummary {
        match context::current() {
            Some(ctx) => self.finish(&ctx).await,
            None => RequestSummary::default(),
        }
    }

    /// Ends the active request without waiting for in-flight operations.
    ///
    /// For synchronous servers; the summary reflects whatever has completed.
    pub fn end_request_now(&self) -> RequestSummary {
        match context::detach() {
            Some(ctx) if ctx.begin_close() => self.seal(&ctx),
            _ => RequestSummary::default(),
        }
    }

    /// Ends a specific request, detaching it if it is the ambient one.
    pub async fn finish(&self, ctx: &RequestContext) -> RequestSummary {
        let summary = self.close(ctx).await;
        context::detach_if(ctx);
        summary
    }

    async fn close(&self, ctx: &RequestContext) -> RequestSummary {
        if !ctx.begin_close() {
            return RequestSummary::default();
        }
        let grace = self.inner.config.finalize_grace.as_duration();
        if !ctx.wait_idle(grace).await {
            tracing::warn!(
                correlation_id = %ctx.correlation_id(),
                in_flight = ctx.in_flight(),
                grace_ms = grace.as_millis(),
                "Request ended with operations still in flight"
            );
        }
        self.seal(ctx)
    }

    fn seal(&self, ctx: &RequestContext) -> RequestSummary {
        let summary = RequestSummary::of(ctx);
        ctx.finalize();
        self.inner.requests_completed.fetch_add(1, Ordering::Relaxed);

        let mut record = LogRecord::new(
            LogLevel::Info,
            RecordKind::Summary,
            "Request completed",
            self.inner.summary_logger.name(),
            self.inner.summary_logger.layer(),
        )
        .with_context(ctx)
        .with_duration(ctx.elapsed())
        .with_fields(json!({
            "operations_logged": summary.operations_logged,
            "errors_encountered": summary.errors_encountered,
            "performance_violations": summary.performance_violations,
            "in_flight_at_close": summary.in_flight_at_close,
        }));
        record.orphaned = false;
        self.inner.sinks.dispatch(&record);

        tracing::debug!(
            correlation_id = %ctx.correlation_id(),
            duration_seconds = summary.duration_seconds,
            operations_logged = summary.operations_logged,
            errors_encountered = summary.errors_encountered,
            performance_violations = summary.performance_violations,
            "Request ended"
        );
        summary
    }

    /// Runs `fut` with a fresh, isolated request slot.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        context::scope(fut).await
    }

    /// Runs one complete request: opens a scope, starts the request, runs
    /// `body` and ends the request.
    pub async fn run_request<T, F, Fut>(
        &self,
        fields: RequestFields,
        body: F,
    ) -> (T, RequestSummary)
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = T>,
    {
        context::scope(async move {
            let ctx = self.start_request(fields);
            let output = body(ctx).await;
            let summary = self.end_request().await;
            (output, summary)
        })
        .await
    }

    /// Read-only health snapshot. Never mutates any context.
    pub fn get_health_status(&self) -> HealthStatus {
        let ctx = context::current();
        let dropped = self.inner.sinks.dropped();

        HealthStatus {
            status: if dropped == 0 {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            },
            active_context: ctx.is_some(),
            correlation_id: ctx.as_ref().map(RequestContext::correlation_id),
            operations_logged: ctx.as_ref().map_or(0, RequestContext::operations_logged),
            errors_tracked: ctx.as_ref().map_or(0, |c| c.errors().error_count()),
            performance_violations: ctx
                .as_ref()
                .map_or(0, |c| c.performance().violation_count()),
            configuration: self.inner.config.snapshot(),
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_completed: self.inner.requests_completed.load(Ordering::Relaxed),
            dropped_records: dropped,
        }
    }

    /// Flushes every sink, waiting for buffered sinks to drain.
    pub async fn flush(&self) {
        for buffer in &self.inner.buffers {
            if let Err(error) = buffer.drain().await {
                tracing::warn!(error = %error, "Failed to drain buffered sink");
            }
        }
        self.inner.sinks.flush();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("sinks", &self.inner.sinks)
            .field(
                "requests_started",
                &self.inner.requests_started.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Builder for [`Coordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: ObservabilityConfig,
    sinks: Vec<Arc<dyn Sink>>,
    fallback: Option<Arc<dyn Sink>>,
    console: bool,
    buffered: bool,
}

impl CoordinatorBuilder {
    /// Sets the configuration
    #[must_use]
    pub fn config(mut self, config: ObservabilityConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a sink
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Adds a console sink using the configured output format
    #[must_use]
    pub const fn console(mut self) -> Self {
        self.console = true;
        self
    }

    /// Sets the sink that takes records another sink failed to write
    #[must_use]
    pub fn fallback(mut self, sink: Arc<dyn Sink>) -> Self {
        self.fallback = Some(sink);
        self
    }

    /// Puts each sink behind an asynchronous buffer. Requires a tokio
    /// runtime at build time.
    #[must_use]
    pub const fn buffered(mut self, enabled: bool) -> Self {
        self.buffered = enabled;
        self
    }

    /// Builds the coordinator. Without any sink, records go to the console.
    pub fn build(self) -> Result<Coordinator, SinkError> {
        let Self {
            config,
            mut sinks,
            fallback,
            console,
            buffered,
        } = self;

        if console || sinks.is_empty() {
            sinks.push(Arc::new(ConsoleSink::new(config.output_format)));
        }

        let mut set = SinkSet::new(config.log_level);
        let mut buffers = Vec::new();
        for sink in sinks {
            if buffered {
                let buffer = Arc::new(BufferedSink::spawn(
                    sink,
                    config.sink_buffer_size.into_inner(),
                    config.batch_size.into_inner(),
                    config.flush_interval.as_duration(),
                )?);
                buffers.push(Arc::clone(&buffer));
                set.register(buffer);
            } else {
                set.register(sink);
            }
        }
        if let Some(fallback) = fallback {
            set = set.with_fallback(fallback);
        }

        Ok(Coordinator::assemble(config, set, buffers))
    }
}
