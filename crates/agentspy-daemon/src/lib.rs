// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-daemon
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Process wiring for Agent Spy: the dashboard query
//! API, the WebSocket endpoint, health probes, and the middleware stack,
//! merged with the three receiver surfaces from [`agentspy_receivers`]
//! into one Axum [`Router`]. [`main`](../fn.main.html) (in `main.rs`) owns
//! everything this crate doesn't: config parsing, store/pool setup, and
//! the OTLP/gRPC server's lifecycle.

mod api;
mod health;
mod middleware;
mod ws;

use agentspy_config::AppConfig;
use agentspy_repository::RunRepository;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

pub use api::{get_hierarchy, get_ingest_telemetry, get_stats_summary, get_versions, list_root_runs};
pub use health::{health, live, ready, traces};
pub use middleware::{auth_middleware, cors_layer, rate_limit_middleware, AuthGate};
pub use ws::ws_handler;

/// Default sliding-window rate-limit budget: generous enough that no
/// single-process test or small deployment trips it, tight enough to
/// protect against a runaway client.
const RATE_LIMIT_MAX_REQUESTS: u32 = 600;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Shared state for every Axum handler in this crate: the bound
/// repository (store + hub) and the immutable configuration snapshot.
/// Cheap to clone — both fields are already behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The run repository this daemon serves reads and writes through.
    pub repo: Arc<RunRepository>,
    /// The configuration this daemon was started with.
    pub config: Arc<AppConfig>,
}

/// Builds the complete Axum application: health probes, the dashboard
/// query API, the WebSocket endpoint, the LangSmith-compatible REST
/// surface, and the OTLP/HTTP receiver — all sharing one [`RunRepository`]
/// — wrapped in the request-id/logging/CORS/rate-limit/(optional auth)
/// middleware stack.
///
/// The OTLP/gRPC receiver is not part of this router: it runs on its own
/// port under a `tonic` server (see `main.rs`), since gRPC and HTTP/1.1
/// don't share a listener here.
pub fn build_app(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/health/traces", get(health::traces))
        .with_state(state.clone());

    let dashboard_routes = Router::new()
        .route("/api/v1/versions", get(api::get_versions))
        .route("/api/v1/dashboard/runs/roots", get(api::list_root_runs))
        .route("/api/v1/dashboard/runs/{id}/hierarchy", get(api::get_hierarchy))
        .route("/api/v1/dashboard/stats/summary", get(api::get_stats_summary))
        .route("/api/v1/telemetry/ingest", get(api::get_ingest_telemetry))
        .route("/ws", get(ws::ws_handler))
        .route("/api/v1/ws", get(ws::ws_handler))
        .with_state(state.clone());

    let ingestion_routes = Router::new()
        .merge(agentspy_receivers::langsmith_router(
            state.repo.clone(),
            state.config.max_trace_size_mb,
            state.config.otlp_grpc_enabled,
            state.config.otlp_http_path.clone(),
        ))
        .merge(agentspy_receivers::otlp_http_router(
            state.repo.clone(),
            &state.config.otlp_http_path,
        ));

    let mut protected = dashboard_routes.merge(ingestion_routes);

    if state.config.require_auth {
        let gate = AuthGate::new(state.config.api_key_list().into_iter().map(String::from).collect());
        protected = protected.layer(axum::middleware::from_fn_with_state(gate, middleware::auth_middleware));
    }

    let limiter = Arc::new(agentspy_backends::SlidingWindowRateLimiter::new(
        RATE_LIMIT_MAX_REQUESTS,
        RATE_LIMIT_WINDOW,
    ));
    protected = protected.layer(axum::middleware::from_fn_with_state(limiter, middleware::rate_limit_middleware));

    Router::new()
        .merge(health_routes)
        .merge(protected)
        .layer(cors_layer(&state.config.cors_origin_list()))
        .layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspy_config::LogFormat;
    use agentspy_hub::EventHub;
    use agentspy_store::InMemoryRunStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            otlp_grpc_enabled: false,
            otlp_grpc_port: 4317,
            otlp_http_path: "/v1/traces".into(),
            database_url: "sqlite::memory:".into(),
            database_pool_size: 5,
            max_trace_size_mb: 10,
            request_timeout_secs: 30,
            require_auth: false,
            api_keys: String::new(),
            cors_origins: "*".into(),
            log_level: "info".into(),
            log_format: LogFormat::Json,
        }
    }

    fn test_state() -> AppState {
        let store = Arc::new(InMemoryRunStore::new());
        let hub = EventHub::new(256);
        let repo = Arc::new(RunRepository::new(store, hub));
        AppState {
            repo,
            config: Arc::new(test_config()),
        }
    }

    #[tokio::test]
    async fn unauthenticated_request_is_ok_when_auth_disabled() {
        let app = build_app(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/dashboard/stats/summary")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_gate_rejects_missing_key_when_required() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.require_auth = true;
        config.api_keys = "secret".into();
        state.config = Arc::new(config);

        let app = build_app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/dashboard/stats/summary")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_gate_does_not_cover_health_endpoints() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.require_auth = true;
        config.api_keys = "secret".into();
        state.config = Arc::new(config);

        let app = build_app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn versions_endpoint_reports_current_version() {
        let app = build_app(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/versions")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["current"], "v1.0");
    }

    #[tokio::test]
    async fn otlp_http_path_is_configurable() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.otlp_http_path = "/custom/traces".into();
        state.config = Arc::new(config);

        let app = build_app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/custom/traces")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({ "resourceSpans": [] }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
