//! HTTP adapter: an `axum` middleware that asks the engine before letting
//! a request through (`State<...>` extraction, `Json<Value>` bodies,
//! explicit `StatusCode`).

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::engine::{Decision, ProtectionEngine, ReportOutcome};

/// `axum::middleware::from_fn_with_state(engine, protect)`. The resource
/// name is the request's path — empty paths are rejected here rather than
/// inside the engine.
pub async fn protect(
    State(engine): State<Arc<ProtectionEngine>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let resource = req.uri().path().to_string();
    if resource.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": "EMPTY_RESOURCE", "message": "resource must be non-empty"})),
        )
            .into_response();
    }

    let (decision, handle) = engine.acquire_with_handle(&resource);
    match decision {
        Decision::BlockRateLimit => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "code": "RATE_LIMITED",
                "message": format!("rate limit exceeded for {resource}"),
            })),
        )
            .into_response(),
        Decision::BlockCircuitOpen => {
            let retry_timeout_ms = engine
                .stats(&resource)
                .breaker
                .map(|b| b.retry_timeout_ms)
                .unwrap_or(0);
            let mut resp = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "code": "CIRCUIT_OPEN",
                    "message": format!("circuit open for {resource}"),
                })),
            )
                .into_response();
            if retry_timeout_ms > 0 {
                if let Ok(value) = HeaderValue::from_str(&(retry_timeout_ms / 1000).max(1).to_string())
                {
                    resp.headers_mut().insert("Retry-After", value);
                }
            }
            resp
        }
        Decision::Admit => {
            let handle = handle.expect("Admit decisions always carry a handle");
            let started = Instant::now();
            let resp = next.run(req).await;
            let elapsed = started.elapsed();
            let outcome = if resp.status().is_server_error() {
                ReportOutcome::Error
            } else {
                ReportOutcome::Success
            };
            engine.report(&handle, outcome, elapsed);
            resp
        }
    }
}
