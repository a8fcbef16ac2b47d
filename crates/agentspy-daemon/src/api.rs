// SPDX-License-Identifier: MIT OR Apache-2.0
//! Query API handlers: root run listing, hierarchy assembly, and
//! the dashboard stats summary. Each handler is a thin translation from an
//! Axum extractor onto [`agentspy_repository::RunRepository`] plus a wire
//! shape the dashboard can render directly.

use crate::AppState;
use agentspy_api_versioning::{ApiVersion, VersionedEndpoint};
use agentspy_core::{Run, RunStatus};
use agentspy_error::AgentSpyError;
use agentspy_repository::{RepositoryError, RunHierarchy, RunView};
use agentspy_store::{Page, PageRequest, RootFilter};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 1000;
const DEFAULT_HIERARCHY_DEPTH: usize = 50;

fn api_error(err: RepositoryError) -> AgentSpyError {
    match err {
        RepositoryError::Store(e) => AgentSpyError::retryable(e.to_string()),
    }
}

/// Wire shape for a [`RunView`]: the run's own fields flattened alongside
/// the server-computed `duration_ms`/`child_run_count`.
#[derive(Debug, Serialize)]
pub struct RunViewWire {
    #[serde(flatten)]
    pub run: Run,
    pub duration_ms: Option<i64>,
    pub child_run_count: u64,
}

impl From<RunView> for RunViewWire {
    fn from(view: RunView) -> Self {
        Self {
            run: view.run,
            duration_ms: view.duration_ms,
            child_run_count: view.child_run_count,
        }
    }
}

/// `GET /api/v1/dashboard/runs/roots` query parameters.
#[derive(Debug, Deserialize)]
pub struct RootsParams {
    pub project: Option<String>,
    pub status: Option<RunStatus>,
    pub search: Option<String>,
    pub start_time_gte: Option<DateTime<Utc>>,
    pub start_time_lte: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PageWire<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T, U: From<T>> From<Page<T>> for PageWire<U> {
    fn from(page: Page<T>) -> Self {
        Self {
            items: page.items.into_iter().map(U::from).collect(),
            total: page.total,
        }
    }
}

/// `GET /api/v1/dashboard/runs/roots?project=&status=&search=&start_time_gte=&start_time_lte=&limit=&offset=`
pub async fn list_root_runs(
    State(state): State<AppState>,
    Query(params): Query<RootsParams>,
) -> Result<Json<PageWire<RunViewWire>>, AgentSpyError> {
    let filter = RootFilter {
        project_name: params.project,
        status: params.status,
        search: params.search,
        start_time_gte: params.start_time_gte,
        start_time_lte: params.start_time_lte,
    };
    let page = PageRequest {
        limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        offset: params.offset.unwrap_or(0),
    };

    let result = state.repo.get_root_runs(filter, page).await.map_err(api_error)?;
    Ok(Json(result.into()))
}

#[derive(Debug, Serialize)]
pub struct HierarchyWire {
    pub root: RunViewWire,
    pub descendants: Vec<RunViewWire>,
    pub total_runs: u64,
    pub max_depth: usize,
}

impl From<RunHierarchy> for HierarchyWire {
    fn from(h: RunHierarchy) -> Self {
        Self {
            root: h.root.into(),
            descendants: h.descendants.into_iter().map(RunViewWire::from).collect(),
            total_runs: h.total_runs,
            max_depth: h.max_depth,
        }
    }
}

/// `GET /api/v1/dashboard/runs/{id}/hierarchy`
pub async fn get_hierarchy(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<HierarchyWire>, AgentSpyError> {
    let hierarchy = state
        .repo
        .get_hierarchy(run_id, DEFAULT_HIERARCHY_DEPTH)
        .await
        .map_err(api_error)?
        .ok_or_else(|| AgentSpyError::not_found(format!("run {run_id} not found")))?;
    Ok(Json(hierarchy.into()))
}

/// `GET /api/v1/dashboard/stats/summary`
pub async fn get_stats_summary(State(state): State<AppState>) -> Result<Json<agentspy_store::AggregateStats>, AgentSpyError> {
    let stats = state
        .repo
        .get_dashboard_stats(chrono::Duration::hours(24))
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub current: String,
    pub supported: Vec<String>,
    pub endpoints: Vec<VersionedEndpointWire>,
}

#[derive(Debug, Serialize)]
pub struct VersionedEndpointWire {
    pub path: String,
    pub min_version: String,
    pub deprecated: bool,
}

impl From<&VersionedEndpoint> for VersionedEndpointWire {
    fn from(ep: &VersionedEndpoint) -> Self {
        Self {
            path: ep.path.clone(),
            min_version: ep.min_version.to_string(),
            deprecated: ep.deprecated,
        }
    }
}

/// `GET /api/v1/versions` — the version registry a dashboard client can
/// use to detect which endpoints this server supports, ahead of the
/// content-negotiation path (dynamic dispatch across receivers
/// note applies symmetrically to the read surface: one registry, additive
/// versions).
pub async fn get_versions() -> Json<VersionsResponse> {
    let registry = agentspy_api_versioning::default_registry();
    let current = *registry.current_version();
    Json(VersionsResponse {
        current: current.to_string(),
        supported: registry.supported_versions().iter().map(ApiVersion::to_string).collect(),
        endpoints: registry.endpoints_for_version(&current).into_iter().map(VersionedEndpointWire::from).collect(),
    })
}

/// `GET /api/v1/telemetry/ingest` — aggregated ingest-latency and
/// error-rate statistics across all three receivers since process start
/// (ambient observability: never gates ingestion itself).
pub async fn get_ingest_telemetry() -> Json<agentspy_telemetry::IngestSummary> {
    Json(agentspy_telemetry::global_ingest_metrics().summary())
}
