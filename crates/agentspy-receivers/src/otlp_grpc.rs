//! OTLP/gRPC trace receiver: a [`TraceService`] implementation
//! mountable on a [`tonic`] server, sharing [`crate::canonicalize`] with the
//! OTLP/HTTP receiver so both protocols produce identical runs.

use crate::canonicalize::span_to_run;
use agentspy_hub::EventSource;
use agentspy_repository::{IngestBatch, RunRepository};
use chrono::Utc;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceService;
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// Thin adapter from tonic's generated `TraceService` trait onto the
/// repository. Mount with
/// `TraceServiceServer::new(OtlpGrpcReceiver::new(repo))`.
pub struct OtlpGrpcReceiver {
    repo: Arc<RunRepository>,
}

impl OtlpGrpcReceiver {
    pub fn new(repo: Arc<RunRepository>) -> Self {
        Self { repo }
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let request = request.into_inner();

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
        let result = self
            .repo
            .ingest_batch(
                IngestBatch {
                    posts,
                    patches: vec![],
                    source: EventSource::OtlpGrpc,
                },
                Utc::now(),
            )
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        agentspy_telemetry::global_ingest_metrics().record(agentspy_telemetry::IngestMetrics {
            source: "otlp_grpc".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            rows_count: span_count as u64,
            errors_count: result.failures.len() as u64,
        });

        tracing::debug!(
            span_count,
            accepted = result.created.len() + result.updated.len(),
            rejected = result.failures.len(),
            "otlp/grpc export processed"
        );

        Ok(Response::new(ExportTraceServiceResponse { partial_success: None }))
    }
}
