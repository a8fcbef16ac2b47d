// SPDX-License-Identifier: MIT OR Apache-2.0
//! Health probes: `/health`, `/health/live`, `/health/ready`,
//! and `/health/traces` (the completeness report, with the
//! degraded/unhealthy score thresholds below).

use crate::AppState;
use agentspy_repository::AnomalyKind;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Duration;
use serde::{Deserialize, Serialize};

const DEGRADED_THRESHOLD: f64 = 0.95;
const UNHEALTHY_THRESHOLD: f64 = 0.90;
const COMPLETENESS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

/// `GET /health` — static liveness, no downstream calls.
pub async fn health() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /health/live` — process is up and scheduling tasks.
pub async fn live() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /health/ready` — the store can currently service a read. 503 when it
/// can't, per the `Retryable` error kind's HTTP mapping.
pub async fn ready(State(state): State<AppState>) -> Response {
    match state.repo.get_dashboard_stats(Duration::hours(1)).await {
        Ok(_) => Json(HealthBody {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthBody {
                    status: "unavailable",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TracesHealthBody {
    status: &'static str,
    checked: u64,
    completed_missing_outputs: u64,
    long_running_potential_orphans: u64,
    incomplete_completions: u64,
    completeness_score: f64,
}

/// `GET /health/traces` — runs the completeness audit over the last 24h and
/// reports the score and per-class anomaly counts.
pub async fn traces(State(state): State<AppState>) -> Response {
    let report = match state.repo.check_completeness(Duration::hours(COMPLETENESS_WINDOW_HOURS)).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "completeness audit failed");
            return (StatusCode::SERVICE_UNAVAILABLE, Json(HealthBody { status: "unavailable", version: env!("CARGO_PKG_VERSION") }))
                .into_response();
        }
    };

    let mut completed_missing_outputs = 0u64;
    let mut long_running_potential_orphans = 0u64;
    let mut incomplete_completions = 0u64;
    for anomaly in &report.anomalies {
        match anomaly.kind {
            AnomalyKind::CompletedMissingOutputs => completed_missing_outputs += 1,
            AnomalyKind::LongRunningPotentialOrphan => long_running_potential_orphans += 1,
            AnomalyKind::IncompleteCompletion => incomplete_completions += 1,
        }
    }

    let completeness_score = if report.checked == 0 {
        1.0
    } else {
        1.0 - (report.anomalies.len() as f64 / report.checked as f64)
    };

    let status = if completeness_score < UNHEALTHY_THRESHOLD {
        "unhealthy"
    } else if completeness_score < DEGRADED_THRESHOLD {
        "degraded"
    } else {
        "ok"
    };

    let body = TracesHealthBody {
        status,
        checked: report.checked,
        completed_missing_outputs,
        long_running_potential_orphans,
        incomplete_completions,
        completeness_score,
    };

    let http_status = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (http_status, Json(body)).into_response()
}
