//! axum integration for `reqscope`.
//!
//! [`request_scope_middleware`] wraps every request in its own request
//! context: it starts the request from the incoming headers, logs the API
//! boundary on the way in and out, ends the request and returns the
//! correlation id in the `x-correlation-id` response header.
//! [`health_router`] exposes the coordinator's health snapshot.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use reqscope::{Coordinator, Direction, HealthStatus, Layer, RequestFields};
use serde_json::json;

/// Response header carrying the request's correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Request headers mapped onto request fields.
pub const FIELD_HEADERS: [(&str, &str); 5] = [
    ("x-session-id", "session_id"),
    ("x-user-id", "user_id"),
    ("x-investigation-id", "investigation_id"),
    ("x-phase", "phase"),
    ("x-request-id", "request_id"),
];

/// Route serving the health snapshot.
pub const HEALTH_PATH: &str = "/health/observability";

/// Extracts request tags from headers.
///
/// Invalid tags are skipped. An upstream `x-request-id` is kept as the
/// `request_id` attribute; the correlation id is always generated fresh.
pub fn request_fields(headers: &HeaderMap) -> RequestFields {
    RequestFields::from_pairs(FIELD_HEADERS.iter().filter_map(|(header, field)| {
        headers
            .get(*header)
            .and_then(|value| value.to_str().ok())
            .map(|value| (*field, value))
    }))
}

/// Runs the rest of the stack inside a fresh request context.
pub async fn request_scope_middleware(
    State(coordinator): State<Coordinator>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let operation = format!("{method} {path}");
    let fields = request_fields(request.headers());
    let logger = coordinator.logger("http", Layer::Api);

    let ((mut response, correlation_id), summary) = coordinator
        .run_request(fields, |ctx| async move {
            logger.log_boundary(
                &operation,
                Direction::Inbound,
                json!({"method": method.as_str(), "path": path}),
            );
            let response = next.run(request).await;
            logger.log_boundary(
                &operation,
                Direction::Outbound,
                json!({
                    "method": method.as_str(),
                    "path": path,
                    "status": response.status().as_u16(),
                }),
            );
            (response, ctx.correlation_id())
        })
        .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    tracing::debug!(
        correlation_id = %correlation_id,
        status = response.status().as_u16(),
        operations_logged = summary.operations_logged,
        "HTTP request completed"
    );
    response
}

/// Wraps every route of `router` in [`request_scope_middleware`].
pub fn with_request_scope<S>(router: Router<S>, coordinator: Coordinator) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(
        coordinator,
        request_scope_middleware,
    ))
}

/// Router serving `GET /health/observability`.
pub fn health_router<S>(coordinator: Coordinator) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(HEALTH_PATH, get(observability_health))
        .with_state(coordinator)
}

async fn observability_health(State(coordinator): State<Coordinator>) -> Json<HealthStatus> {
    Json(coordinator.get_health_status())
}
