//! OTLP/HTTP trace receiver: `POST /v1/traces`, accepting either
//! `application/x-protobuf` or `application/json` bodies per the OTLP/HTTP
//! spec's content negotiation rules.

use crate::canonicalize::span_to_run;
use agentspy_error::AgentSpyError;
use agentspy_hub::EventSource;
use agentspy_repository::{IngestBatch, RunRepository};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use prost::Message;
use std::sync::Arc;
use std::time::Instant;

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn decode_request(headers: &HeaderMap, body: &Bytes) -> Result<ExportTraceServiceRequest, AgentSpyError> {
    if is_json(headers) {
        serde_json::from_slice(body)
            .map_err(|e| AgentSpyError::validation(format!("invalid OTLP/JSON body: {e}")))
    } else {
        ExportTraceServiceRequest::decode(body.as_ref())
            .map_err(|e| AgentSpyError::validation(format!("invalid OTLP protobuf body: {e}")))
    }
}

async fn export_traces(
    State(repo): State<Arc<RunRepository>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AgentSpyError> {
    let json_requested = is_json(&headers);
    let request = decode_request(&headers, &body)?;

    let posts = request
        .resource_spans
        .iter()
        .flat_map(|rs| {
            let resource_attrs = rs.resource.as_ref().map(|r| r.attributes.as_slice()).unwrap_or(&[]);
            rs.scope_spans
                .iter()
                .flat_map(move |ss| ss.spans.iter().map(move |span| span_to_run(resource_attrs, span)))
        })
        .collect::<Vec<_>>();

    let span_count = posts.len();
    let started = Instant::now();
    let result = repo
        .ingest_batch(
            IngestBatch {
                posts,
                patches: vec![],
                source: EventSource::OtlpHttp,
            },
            Utc::now(),
        )
        .await
        .map_err(|e| AgentSpyError::retryable(e.to_string()))?;
    agentspy_telemetry::global_ingest_metrics().record(agentspy_telemetry::IngestMetrics {
        source: "otlp_http".into(),
        duration_ms: started.elapsed().as_millis() as u64,
        rows_count: span_count as u64,
        errors_count: result.failures.len() as u64,
    });

    tracing::debug!(
        span_count,
        accepted = result.created.len() + result.updated.len(),
        rejected = result.failures.len(),
        "otlp/http export processed"
    );

    let response = ExportTraceServiceResponse { partial_success: None };
    if json_requested {
        Ok((StatusCode::OK, axum::Json(response)).into_response())
    } else {
        Ok((
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/x-protobuf")],
            response.encode_to_vec(),
        )
            .into_response())
    }
}

/// Builds the OTLP/HTTP trace ingestion surface at `path`
/// (`OTLP_HTTP_PATH`, default `/v1/traces`).
pub fn router(repo: Arc<RunRepository>, path: &str) -> Router {
    Router::new().route(path, post(export_traces)).with_state(repo)
}
