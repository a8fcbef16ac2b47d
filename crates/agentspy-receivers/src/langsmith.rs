//! LangSmith-compatible REST receiver: `POST /api/v1/runs`,
//! `PATCH /api/v1/runs/{run_id}`, `GET /api/v1/runs/{run_id}`, and
//! `POST /api/v1/runs/batch`, plus the `GET /api/v1/info` capability probe
//! the LangSmith SDK calls on startup.

use agentspy_core::{NewRun, RunPatch, RunType};
use agentspy_error::{AgentSpyError, RowError};
use agentspy_hub::EventSource;
use agentspy_json_guard::{JsonGuardLimits, exceeds_byte_limit, validate_json_object};
use agentspy_repository::{IngestBatch, RunRepository};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

fn record_ingest_metrics(rows_count: usize, errors_count: usize, started: Instant) {
    agentspy_telemetry::global_ingest_metrics().record(agentspy_telemetry::IngestMetrics {
        source: "langsmith".into(),
        duration_ms: started.elapsed().as_millis() as u64,
        rows_count: rows_count as u64,
        errors_count: errors_count as u64,
    });
}

#[derive(Clone)]
struct LangsmithState {
    repo: Arc<RunRepository>,
    single_limits: JsonGuardLimits,
    otlp_grpc_enabled: bool,
    otlp_http_path: String,
}

/// Wire shape of a LangSmith `post` entry: a brand-new run. Unlike
/// [`RunPatch`], fields here have no absent-vs-null distinction — a field
/// that's present at creation is simply set.
#[derive(Debug, Deserialize)]
struct RunPostWire {
    id: Uuid,
    name: String,
    run_type: RunType,
    start_time: chrono::DateTime<Utc>,
    #[serde(default)]
    trace_id: Option<Uuid>,
    #[serde(default)]
    parent_run_id: Option<Uuid>,
    #[serde(default)]
    end_time: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    inputs: Option<Value>,
    #[serde(default)]
    outputs: Option<Value>,
    #[serde(default)]
    extra: Option<Value>,
    #[serde(default)]
    serialized: Option<Value>,
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    reference_example_id: Option<Uuid>,
    #[serde(default)]
    project_name: Option<String>,
}

impl RunPostWire {
    fn into_new_run_and_patch(self) -> (NewRun, RunPatch) {
        let new = NewRun {
            id: self.id,
            name: self.name,
            run_type: self.run_type,
            start_time: self.start_time,
        };
        let mut patch = RunPatch::empty(self.id);
        patch.trace_id = self.trace_id.map(Some);
        patch.parent_run_id = self.parent_run_id.map(Some);
        patch.end_time = self.end_time.map(Some);
        patch.inputs = self.inputs.map(Some);
        patch.outputs = self.outputs.map(Some);
        patch.extra = self.extra.map(Some);
        patch.serialized = self.serialized.map(Some);
        patch.events = self.events;
        patch.error = self.error.map(Some);
        patch.tags = (!self.tags.is_empty()).then_some(self.tags);
        patch.reference_example_id = self.reference_example_id.map(Some);
        patch.project_name = self.project_name.map(Some);
        (new, patch)
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunBatchWire {
    #[serde(default)]
    post: Vec<Value>,
    #[serde(default)]
    patch: Vec<Value>,
}

/// Best-effort id for a row that failed to parse: the raw `id` field,
/// verbatim, even if it isn't a valid UUID — `RowError::id` is deliberately
/// a plain string for exactly this reason: a malformed id in
/// one batch row must not sink the rows around it).
fn row_id_string(raw: &Value) -> String {
    raw.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| raw.get("id").map(|v| v.to_string()).unwrap_or_else(|| "<missing id>".into()))
}

/// Wire shape of `POST /api/v1/runs/batch`'s response, bit-exact for the
/// LangSmith SDK clients this endpoint is compatible with.
#[derive(Debug, Serialize, Default)]
struct BatchResponseBody {
    success: bool,
    created_count: usize,
    updated_count: usize,
    errors: Vec<RowError>,
}

/// `GET /api/v1/info` response shape: at minimum `version`,
/// `batch_ingest_config.size_limit_bytes`, and `tenant_handle`, so the
/// LangSmith SDK's startup capability probe gets what it expects. Also
/// reports which receivers are live so a dashboard client doesn't need a
/// second round-trip to find out.
#[derive(Debug, Serialize)]
struct InfoResponse {
    version: &'static str,
    tenant_handle: &'static str,
    instance_flags: InfoFlags,
    batch_ingest_config: BatchIngestConfig,
    otlp_grpc_enabled: bool,
    otlp_http_path: String,
}

#[derive(Debug, Serialize)]
struct InfoFlags {
    streaming: bool,
}

#[derive(Debug, Serialize)]
struct BatchIngestConfig {
    size_limit_bytes: usize,
    size_limit: usize,
    scale_up_nthreads_limit: u32,
}

async fn get_info(State(state): State<LangsmithState>) -> impl IntoResponse {
    let batch_limits = JsonGuardLimits::batch();
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        tenant_handle: "agent-spy",
        instance_flags: InfoFlags { streaming: true },
        batch_ingest_config: BatchIngestConfig {
            size_limit_bytes: batch_limits.max_size_bytes,
            size_limit: batch_limits.max_size_bytes,
            scale_up_nthreads_limit: 16,
        },
        otlp_grpc_enabled: state.otlp_grpc_enabled,
        otlp_http_path: state.otlp_http_path.clone(),
    })
}

fn guarded_json(bytes: &Bytes, limits: JsonGuardLimits) -> Result<Value, AgentSpyError> {
    if exceeds_byte_limit(bytes.len(), limits) {
        return Err(AgentSpyError::payload_too_large("payload exceeds the configured size limit")
            .with_context("bytes", bytes.len()));
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| AgentSpyError::validation(format!("invalid JSON body: {e}")))?;
    let errors = validate_json_object(&value, limits);
    if !errors.is_empty() {
        return Err(AgentSpyError::validation(errors.join("; ")));
    }
    Ok(value)
}

async fn create_run(State(state): State<LangsmithState>, body: Bytes) -> Result<Response, AgentSpyError> {
    let value = guarded_json(&body, state.single_limits)?;
    let wire: RunPostWire =
        serde_json::from_value(value).map_err(|e| AgentSpyError::validation(format!("invalid run body: {e}")))?;
    let id = wire.id;
    let (new, patch) = wire.into_new_run_and_patch();

    let started = Instant::now();
    let result = state
        .repo
        .ingest_batch(
            IngestBatch {
                posts: vec![(new, patch)],
                patches: vec![],
                source: EventSource::Langsmith,
            },
            Utc::now(),
        )
        .await
        .map_err(|e| AgentSpyError::retryable(e.to_string()))?;
    record_ingest_metrics(1, result.failures.len(), started);

    if let Some(failure) = result.failures.into_iter().next() {
        return Err(AgentSpyError::validation(failure.message).with_context("run_id", failure.id));
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

async fn patch_run(
    State(state): State<LangsmithState>,
    Path(run_id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, AgentSpyError> {
    let mut value = guarded_json(&body, state.single_limits)?;
    if let Value::Object(ref mut map) = value {
        map.insert("id".into(), Value::String(run_id.to_string()));
    }
    let patch: RunPatch =
        serde_json::from_value(value).map_err(|e| AgentSpyError::validation(format!("invalid patch body: {e}")))?;

    let started = Instant::now();
    let result = state
        .repo
        .ingest_batch(
            IngestBatch {
                posts: vec![],
                patches: vec![patch],
                source: EventSource::Langsmith,
            },
            Utc::now(),
        )
        .await
        .map_err(|e| AgentSpyError::retryable(e.to_string()))?;
    record_ingest_metrics(1, result.failures.len(), started);

    if let Some(failure) = result.failures.into_iter().next() {
        return Err(AgentSpyError::validation(failure.message).with_context("run_id", failure.id));
    }
    Ok(StatusCode::OK.into_response())
}

async fn get_run(State(state): State<LangsmithState>, Path(run_id): Path<Uuid>) -> Result<Response, AgentSpyError> {
    let view = state
        .repo
        .get_run(run_id)
        .await
        .map_err(|e| AgentSpyError::retryable(e.to_string()))?;
    match view {
        Some(view) => Ok(Json(view.run).into_response()),
        None => Err(AgentSpyError::not_found(format!("run {run_id} not found"))),
    }
}

async fn batch_runs(State(state): State<LangsmithState>, body: Bytes) -> Result<Response, AgentSpyError> {
    let value = guarded_json(&body, JsonGuardLimits::batch())?;
    let wire: RunBatchWire =
        serde_json::from_value(value).map_err(|e| AgentSpyError::validation(format!("invalid batch body: {e}")))?;

    // Each row is parsed independently: one malformed id (or any other
    // per-row shape error) must not sink the rows around it.
    let mut posts = Vec::with_capacity(wire.post.len());
    let mut patches = Vec::with_capacity(wire.patch.len());
    let mut parse_failures = Vec::new();

    for raw in wire.post {
        let row_id = row_id_string(&raw);
        match serde_json::from_value::<RunPostWire>(raw) {
            Ok(post) => posts.push(post.into_new_run_and_patch()),
            Err(e) => parse_failures.push(RowError::new(row_id, format!("invalid run: {e}"))),
        }
    }
    for raw in wire.patch {
        let row_id = row_id_string(&raw);
        match serde_json::from_value::<RunPatch>(raw) {
            Ok(patch) => patches.push(patch),
            Err(e) => parse_failures.push(RowError::new(row_id, format!("invalid patch: {e}"))),
        }
    }

    let rows_count = posts.len() + patches.len();
    let started = Instant::now();
    let mut result = state
        .repo
        .ingest_batch(
            IngestBatch {
                posts,
                patches,
                source: EventSource::Langsmith,
            },
            Utc::now(),
        )
        .await
        .map_err(|e| AgentSpyError::retryable(e.to_string()))?;
    result.failures.extend(parse_failures);
    record_ingest_metrics(rows_count, result.failures.len(), started);

    Ok(Json(BatchResponseBody {
        success: true,
        created_count: result.created.len(),
        updated_count: result.updated.len(),
        errors: result.failures,
    })
    .into_response())
}

/// Builds the LangSmith-compatible REST surface. `max_trace_size_mb` bounds
/// a single run's payload; the batch endpoint uses its own fixed ≈20 MiB
/// ceiling regardless (see [`JsonGuardLimits::batch`]). `otlp_grpc_enabled`
/// and `otlp_http_path` are surfaced verbatim through `GET /api/v1/info` so
/// a dashboard client can discover live receivers without a second call.
pub fn router(
    repo: Arc<RunRepository>,
    max_trace_size_mb: u64,
    otlp_grpc_enabled: bool,
    otlp_http_path: impl Into<String>,
) -> Router {
    let state = LangsmithState {
        repo,
        single_limits: JsonGuardLimits::for_trace_size_mb(max_trace_size_mb as usize),
        otlp_grpc_enabled,
        otlp_http_path: otlp_http_path.into(),
    };
    Router::new()
        .route("/api/v1/info", get(get_info))
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/batch", post(batch_runs))
        .route("/api/v1/runs/{run_id}", get(get_run).patch(patch_run))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspy_hub::EventHub;
    use agentspy_store::InMemoryRunStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let repo = Arc::new(RunRepository::new(Arc::new(InMemoryRunStore::new()), EventHub::default()));
        router(repo, 10, true, "/v1/traces")
    }

    #[tokio::test]
    async fn info_endpoint_reports_streaming_support() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/info")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["instance_flags"]["streaming"], true);
        assert_eq!(value["tenant_handle"], "agent-spy");
        assert!(value["batch_ingest_config"]["size_limit_bytes"].as_u64().unwrap() > 0);
        assert_eq!(value["otlp_grpc_enabled"], true);
        assert_eq!(value["otlp_http_path"], "/v1/traces");
    }

    #[tokio::test]
    async fn create_then_get_round_trips_a_run() {
        let app = app();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::json!({
            "id": id,
            "name": "root",
            "run_type": "chain",
            "start_time": now,
        });

        let create_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create_response.status(), StatusCode::CREATED);

        let get_response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/api/v1/runs/{id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
        let body = get_response.into_body().collect().await.unwrap().to_bytes();
        let run: agentspy_core::Run = serde_json::from_slice(&body).unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.name, "root");
    }

    #[tokio::test]
    async fn get_missing_run_is_404() {
        let app = app();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/api/v1/runs/{}", Uuid::new_v4()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_endpoint_reports_created_ids() {
        let app = app();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::json!({
            "post": [{
                "id": id,
                "name": "root",
                "run_type": "chain",
                "start_time": now,
            }],
            "patch": [],
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs/batch")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["created_count"], 1);
    }

    #[tokio::test]
    async fn batch_endpoint_keeps_valid_rows_when_one_row_is_malformed() {
        let app = app();
        let now = Utc::now();
        let good_one = Uuid::new_v4();
        let good_two = Uuid::new_v4();
        let payload = serde_json::json!({
            "post": [
                { "id": good_one, "name": "first", "run_type": "chain", "start_time": now },
                { "id": "not-a-uuid", "name": "bad", "run_type": "chain", "start_time": now },
                { "id": good_two, "name": "second", "run_type": "chain", "start_time": now },
            ],
            "patch": [],
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs/batch")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["created_count"], 2);
        let errors = parsed["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["id"], "not-a-uuid");
    }

    #[tokio::test]
    async fn oversize_single_run_payload_is_rejected_with_413() {
        let repo = Arc::new(RunRepository::new(Arc::new(InMemoryRunStore::new()), EventHub::default()));
        let app = router(repo, 0, true, "/v1/traces");
        let oversize_body = vec![b'a'; 2_000_000];

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(oversize_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
