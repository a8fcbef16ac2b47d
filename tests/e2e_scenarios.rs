// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios driven through the full daemon stack: HTTP in,
//! store + hub + repository in the middle, HTTP/WebSocket responses out.
//! Each test here stands up a real `build_app` router rather than poking
//! the repository directly, so it also exercises routing, middleware, and
//! wire (de)serialization.

use agentspy_config::{AppConfig, LogFormat};
use agentspy_core::{NewRun, RunPatch, RunType};
use agentspy_daemon::{build_app, AppState};
use agentspy_hub::EventHub;
use agentspy_repository::{IngestBatch, RunRepository};
use agentspy_store::InMemoryRunStore;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;
use uuid::Uuid;

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

fn test_repo() -> Arc<RunRepository> {
    Arc::new(RunRepository::new(Arc::new(InMemoryRunStore::new()), EventHub::new(256)))
}

/// Scenario: LangSmith `POST /api/v1/runs` followed by a `PATCH` that sets
/// `end_time` and `outputs`. The run should read back as `completed` with a
/// server-computed `duration_ms`.
#[tokio::test]
async fn langsmith_create_then_patch_reaches_completed_with_duration() {
    let app = build_app(AppState {
        repo: test_repo(),
        config: Arc::new(test_config()),
    });

    let id = Uuid::new_v4();
    let start = Utc::now();
    let create_body = json!({
        "id": id,
        "name": "root-chain",
        "run_type": "chain",
        "start_time": start,
    });
    let create_response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/v1/runs")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(create_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), axum::http::StatusCode::CREATED);

    let end = start + chrono::Duration::milliseconds(250);
    let patch_body = json!({
        "id": id,
        "end_time": end,
        "outputs": { "answer": "42" },
    });
    let patch_response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("PATCH")
                .uri(format!("/api/v1/runs/{id}"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from(patch_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(patch_response.status(), axum::http::StatusCode::OK);

    let get_response = app
        .oneshot(
            axum::http::Request::builder()
                .uri(format!("/api/v1/runs/{id}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), axum::http::StatusCode::OK);
    let body = get_response.into_body().collect().await.unwrap().to_bytes();
    let run: agentspy_core::Run = serde_json::from_slice(&body).unwrap();
    assert_eq!(run.status, agentspy_core::RunStatus::Completed);
    assert_eq!(run.duration_ms(), Some(250));
}

/// Scenario: a completeness audit window containing mostly clean runs and
/// a handful of `completed`-but-missing-`outputs` anomalies should land in
/// the "degraded" band (`0.90 <= score < 0.95`), not "unhealthy" and not "ok".
#[tokio::test]
async fn completeness_audit_reports_degraded_band_for_a_few_anomalies_in_a_larger_window() {
    let repo = test_repo();
    let now = Utc::now();

    for i in 0..23u32 {
        let id = Uuid::new_v4();
        let mut patch = RunPatch::empty(id);
        patch.end_time = Some(Some(now));
        patch.outputs = Some(Some(json!({ "i": i })));
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(
                    NewRun {
                        id,
                        name: format!("clean-{i}"),
                        run_type: RunType::Chain,
                        start_time: now,
                    },
                    patch,
                )],
                patches: vec![],
                source: agentspy_hub::EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();
    }

    for i in 0..2u32 {
        let id = Uuid::new_v4();
        let mut complete_patch = RunPatch::empty(id);
        complete_patch.end_time = Some(Some(now));
        complete_patch.outputs = Some(Some(json!({ "i": i })));
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(
                    NewRun {
                        id,
                        name: format!("anomaly-{i}"),
                        run_type: RunType::Chain,
                        start_time: now,
                    },
                    complete_patch,
                )],
                patches: vec![],
                source: agentspy_hub::EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        // A later patch clears outputs; status is terminal and sticky, so
        // it stays `completed` with `outputs` now absent.
        let mut clear_patch = RunPatch::empty(id);
        clear_patch.outputs = Some(None);
        repo.ingest_batch(
            IngestBatch {
                posts: vec![],
                patches: vec![clear_patch],
                source: agentspy_hub::EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();
    }

    let app = build_app(AppState {
        repo,
        config: Arc::new(test_config()),
    });
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/health/traces")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "degraded");
    assert_eq!(parsed["checked"], 25);
    assert_eq!(parsed["completed_missing_outputs"], 2);
    let score = parsed["completeness_score"].as_f64().unwrap();
    assert!((0.90..0.95).contains(&score), "expected a degraded-band score, got {score}");
}

/// Scenario: two WebSocket subscribers with different filters only see the
/// event types they asked for.
#[tokio::test]
async fn websocket_subscribers_only_receive_events_they_subscribed_to() {
    let repo = test_repo();
    let app = build_app(AppState {
        repo: repo.clone(),
        config: Arc::new(test_config()),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (created_only, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut created_write, mut created_read) = created_only.split();
    let _ = created_read.next().await.unwrap().unwrap(); // hello
    created_write
        .send(WsMessage::Text(json!({"op": "subscribe", "events": ["trace.created"]}).to_string().into()))
        .await
        .unwrap();

    let (failed_only, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut failed_write, mut failed_read) = failed_only.split();
    let _ = failed_read.next().await.unwrap().unwrap(); // hello
    failed_write
        .send(WsMessage::Text(json!({"op": "subscribe", "events": ["trace.failed"]}).to_string().into()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = Uuid::new_v4();
    let now = Utc::now();
    repo.ingest_batch(
        IngestBatch {
            posts: vec![(
                NewRun {
                    id,
                    name: "root".into(),
                    run_type: RunType::Chain,
                    start_time: now,
                },
                RunPatch::empty(id),
            )],
            patches: vec![],
            source: agentspy_hub::EventSource::Langsmith,
        },
        now,
    )
    .await
    .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), created_read.next())
        .await
        .expect("the created-only subscriber should see trace.created")
        .unwrap()
        .unwrap();
    let WsMessage::Text(text) = frame else { panic!("expected text frame") };
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["type"], "trace.created");

    // The failed-only subscriber should not see this event within a short
    // window; it should instead eventually see only its periodic heartbeat.
    let next = tokio::time::timeout(Duration::from_millis(300), failed_read.next()).await;
    if let Ok(Some(Ok(WsMessage::Text(text)))) = next {
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_ne!(parsed["type"], "trace.created", "failed-only subscriber must not see trace.created");
    }
}

/// Scenario: three freshly-created runs each have `end_time` set but no
/// `outputs` or `error` (e.g. an OTLP span whose status never resolved).
/// They derive to `running`, not `completed`, but the completeness audit
/// should still flag all three as `completed_missing_outputs`.
#[tokio::test]
async fn completeness_audit_flags_fresh_runs_stalled_with_end_time_but_no_verdict() {
    let repo = test_repo();
    let now = Utc::now();

    for i in 0..3u32 {
        let id = Uuid::new_v4();
        let mut patch = RunPatch::empty(id);
        patch.end_time = Some(Some(now));
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(
                    NewRun {
                        id,
                        name: format!("stalled-{i}"),
                        run_type: RunType::Chain,
                        start_time: now,
                    },
                    patch,
                )],
                patches: vec![],
                source: agentspy_hub::EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();
    }

    let app = build_app(AppState {
        repo,
        config: Arc::new(test_config()),
    });
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/health/traces")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["completed_missing_outputs"], 3);
}

/// Scenario: a single-run payload larger than `MAX_TRACE_SIZE_MB` is
/// rejected with 413 and never reaches the store.
#[tokio::test]
async fn oversize_single_run_payload_is_rejected_and_never_persisted() {
    let repo = test_repo();
    let mut config = test_config();
    config.max_trace_size_mb = 1;
    let app = build_app(AppState {
        repo: repo.clone(),
        config: Arc::new(config),
    });

    let id = Uuid::new_v4();
    let mut oversize = json!({
        "id": id,
        "name": "root",
        "run_type": "chain",
        "start_time": Utc::now(),
    });
    oversize["inputs"] = json!({ "blob": "x".repeat(2 * 1_000_000) });

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/v1/runs")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(oversize.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    assert!(repo.get_run(id).await.unwrap().is_none());
}
