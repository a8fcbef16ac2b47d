// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the Agent Spy HTTP surface: request-id assignment,
//! structured request logging, CORS, and the optional API-key auth gate
//! (`REQUIRE_AUTH`/`API_KEYS`). Order matters: request id first (so every
//! later log line can carry it), then logging, then CORS, then auth
//! immediately before the handler.

use agentspy_backends::RateLimiter as _;
use agentspy_backends::SlidingWindowRateLimiter;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

/// A unique request identifier, available as an Axum extension once
/// [`request_id_middleware`] has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Assigns a [`RequestId`] to every request and echoes it back as the
/// `X-Request-Id` response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// Logs method, path, status, and duration for each request via
/// [`tracing`].
pub async fn request_logger_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );

    resp
}

/// Builds the CORS layer from the configured origin list (`*` or a
/// comma-separated allowlist, per `CORS_ORIGINS`).
pub fn cors_layer(origins: &[&str]) -> CorsLayer {
    if origins == ["*"] {
        return CorsLayer::new().allow_origin(AllowOrigin::any());
    }
    let values: Vec<HeaderValue> = origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(values))
}

/// Auth gate state: the set of valid API keys. Constructed once at
/// startup; empty when `REQUIRE_AUTH` is false (in which case the gate is
/// simply not installed as a layer).
#[derive(Clone)]
pub struct AuthGate {
    valid_keys: Arc<Vec<String>>,
}

impl AuthGate {
    /// Builds a gate over the given key set.
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            valid_keys: Arc::new(keys),
        }
    }

    fn accepts(&self, header: Option<&str>) -> bool {
        let Some(header) = header else { return false };
        let presented = header.strip_prefix("Bearer ").unwrap_or(header);
        self.valid_keys.iter().any(|k| k == presented)
    }
}

/// Rejects requests lacking a valid `Authorization` header (bearer or bare
/// key) with 401. The dashboard health endpoints are
/// intentionally routed outside this layer so orchestrators can probe
/// liveness without a key (see [`crate::build_app`]).
pub async fn auth_middleware(State(gate): State<AuthGate>, req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if gate.accepts(header) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "missing or invalid API key",
                "code": "AUTH_ERROR",
            })),
        )
            .into_response()
    }
}

/// Rejects a caller once it exceeds the shared sliding-window budget,
/// keyed by remote address when one is available (requires the listener
/// to be served via `into_make_service_with_connect_info`; falls back to
/// a single shared bucket otherwise). An ambient safety net so one noisy
/// client can't starve ingestion for everyone else (a slow
/// subscriber must not stall ingestion" extends naturally here), never a
/// substitute for the `AuthError`/`ValidationError` kinds.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<SlidingWindowRateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unkeyed".to_string());

    if limiter.check(&key).await {
        next.run(req).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": "rate limit exceeded, retry with backoff",
                "code": "RETRYABLE",
            })),
        )
            .into_response()
    }
}
