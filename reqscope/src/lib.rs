//! `reqscope` - Request-scoped observability coordination
//!
//! One [`Coordinator`] per process owns the configuration and the output
//! sinks. Each inbound request gets a [`RequestContext`] carrying a fresh
//! correlation id, the caller's session tags, a dedup ledger, a performance
//! tracker and an error context. Layer code logs through a
//! [`UnifiedLogger`], which finds the active request ambiently: the context
//! follows the request across `.await` points and into tasks started with
//! [`spawn`], and never leaks into concurrent requests.
//!
//! ```rust,ignore
//! use reqscope::prelude::*;
//!
//! let coordinator = Coordinator::new(ObservabilityConfig::from_env()?);
//! let logger = coordinator.logger("orders", Layer::Service);
//!
//! let (order, summary) = coordinator
//!     .run_request(RequestFields::new().with_user_id(user), |_ctx| async {
//!         logger.operation("place_order", |scope| async move {
//!             scope.record("items", 3);
//!             place_order().await
//!         })
//!         .await
//!     })
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod boundary;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dedup;
pub mod error_context;
pub mod errors;
pub mod logger;
pub mod performance;
pub mod record;
pub mod sink;
pub mod telemetry;
pub mod types;

pub use boundary::{
    BoundaryExternalClient, BoundaryService, CallOptions, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, ExecuteOptions, Instrumented,
};
pub use config::{ObservabilityConfig, OutputFormat};
pub use context::{current, scope, spawn, InRequestExt, RequestContext, RequestFields};
pub use coordinator::{Coordinator, CoordinatorBuilder, HealthState, HealthStatus, RequestSummary};
pub use dedup::DedupPolicy;
pub use errors::{BoundaryError, ConfigError, ContextError, SinkError};
pub use logger::{OperationGuard, OperationScope, UnifiedLogger};
pub use performance::PerformanceThresholds;
pub use record::{LogLevel, LogRecord, RecordKind};
pub use sink::{Sink, SinkSet};
pub use telemetry::init_tracing;
pub use types::{Category, CorrelationId, Direction, Layer, OperationKey};

/// Everything needed to instrument a service.
///
/// ```rust,ignore
/// use reqscope::prelude::*;
/// ```
pub mod prelude {
    pub use crate::boundary::{
        BoundaryExternalClient, BoundaryService, CallOptions, ExecuteOptions, Instrumented,
    };
    pub use crate::config::ObservabilityConfig;
    pub use crate::context::{current, spawn, InRequestExt, RequestContext, RequestFields};
    pub use crate::coordinator::{Coordinator, RequestSummary};
    pub use crate::errors::BoundaryError;
    pub use crate::logger::{OperationScope, UnifiedLogger};
    pub use crate::record::LogLevel;
    pub use crate::types::{Direction, Layer};
}
