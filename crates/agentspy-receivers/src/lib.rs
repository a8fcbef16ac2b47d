// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-receivers
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Ingestion-side protocol adapters: the LangSmith-compatible REST surface,
//! OTLP/HTTP, and OTLP/gRPC. Each one canonicalizes its wire format into
//! `(NewRun, RunPatch)` pairs and hands them to [`agentspy_repository`] —
//! none of them talk to the store or the event hub directly.

mod canonicalize;
mod langsmith;
mod otlp_grpc;
mod otlp_http;

pub use canonicalize::{span_run_id, span_to_run, trace_run_id};
pub use langsmith::router as langsmith_router;
pub use otlp_grpc::OtlpGrpcReceiver;
pub use otlp_http::router as otlp_http_router;
