// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The store adapter (C1): SQL schema, indices, and the upsert/select
//! primitives the repository (C2) builds on. No domain logic lives here —
//! derivation, hierarchy assembly, and completeness scoring are the
//! repository's job. This crate only knows how to get [`agentspy_core::Run`]
//! rows in and out of a database.
//!
//! [`RunStore`] is a trait so the repository can be unit-tested against
//! [`InMemoryRunStore`] without a live database; [`PgRunStore`] is the
//! production implementation over `sqlx::PgPool`.

use agentspy_core::{Run, RunStatus, RunType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes a [`RunStore`] can report.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend connection is dead or the pool is exhausted. Callers
    /// should treat this as retryable (surfaces as HTTP 503 upstream).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// The schema doesn't match what this crate expects (migration drift,
    /// a hand-edited column, etc). Never raised for a duplicate id —
    /// upsert semantics mean that's never an error.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::StorageUnavailable(err.to_string())
            }
            _ => StoreError::ConstraintViolation(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Filter for [`RunStore::list_roots`].
#[derive(Debug, Clone, Default)]
pub struct RootFilter {
    /// Restrict to a logical project.
    pub project_name: Option<String>,
    /// Restrict to a derived status.
    pub status: Option<RunStatus>,
    /// Case-insensitive substring match over `name`.
    pub search: Option<String>,
    /// Inclusive lower bound on `start_time`.
    pub start_time_gte: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `start_time`.
    pub start_time_lte: Option<DateTime<Utc>>,
}

/// Pagination request, already clamped by the caller (query API default 50,
/// max 1000).
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    /// Maximum rows to return.
    pub limit: u32,
    /// Rows to skip before the first returned row.
    pub offset: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// A page of results plus the total matching row count (for client-side
/// pagination controls).
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The rows for this page.
    pub items: Vec<T>,
    /// Total rows matching the filter, ignoring `limit`/`offset`.
    pub total: u64,
}

/// Whether an upserted row was a fresh insert or an update to an existing
/// row — the repository uses this to decide `trace.created` vs
/// `trace.updated` and to tally `created_count`/`updated_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row with this id existed before the call.
    Inserted,
    /// A row with this id already existed and was overwritten.
    Updated,
}

/// Per-row result of [`RunStore::upsert_runs`].
#[derive(Debug, Clone)]
pub struct UpsertResult {
    /// The id this result is about.
    pub id: Uuid,
    /// Insert or update outcome.
    pub outcome: UpsertOutcome,
}

/// Aggregate counts for the dashboard summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Total runs stored.
    pub total_runs: u64,
    /// Counts keyed by status wire string (`"running"`, `"completed"`, `"failed"`).
    pub status_distribution: BTreeMap<String, u64>,
    /// Counts keyed by run-type wire string.
    pub run_type_distribution: BTreeMap<String, u64>,
    /// Counts keyed by project name (`None` bucketed under an empty string).
    pub project_distribution: BTreeMap<String, u64>,
    /// Runs whose `start_time` falls within the requested recency window.
    pub recent_count: u64,
}

// ---------------------------------------------------------------------------
// RunStore trait
// ---------------------------------------------------------------------------

/// Primitives the repository (C2) composes into the canonical run model's
/// behavior. No row here is ever silently dropped on a duplicate id:
/// `upsert_runs` always either inserts or updates.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Upserts a batch of fully-resolved rows atomically. The caller (the
    /// repository) has already merged any patch on top of the prior row in
    /// memory; this call is the DB-level write-through of that merge.
    async fn upsert_runs(&self, rows: &[Run]) -> Result<Vec<UpsertResult>, StoreError>;

    /// Fetches a single run by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Fetches the direct children of `parent_id`, ordered by `start_time`.
    async fn get_children(&self, parent_id: Uuid) -> Result<Vec<Run>, StoreError>;

    /// Fetches every run reachable from `root_id` by following
    /// `parent_run_id` edges, up to `max_depth` levels, via iterative BFS
    /// over [`RunStore::get_children`] (bounded, so a pathological fan-out
    /// can't run away).
    async fn get_subtree(&self, root_id: Uuid, max_depth: usize) -> Result<Vec<Run>, StoreError>;

    /// Lists root runs (`parent_run_id IS NULL`) matching `filter`.
    async fn list_roots(&self, filter: &RootFilter, page: PageRequest) -> Result<Page<Run>, StoreError>;

    /// Computes dashboard aggregate statistics; `recency_window` bounds the
    /// `recent_count` field only, not the totals.
    async fn aggregate_stats(&self, recency_window: Duration) -> Result<AggregateStats, StoreError>;

    /// Returns every run whose `updated_at` falls within `window` of now —
    /// candidates for the repository's completeness audit.
    async fn scan_incomplete(&self, window: Duration) -> Result<Vec<Run>, StoreError>;

    /// Count of direct children for each id in `parent_ids`, in one query —
    /// used by `get_root_runs` to avoid an N+1 per-row count.
    async fn count_children(&self, parent_ids: &[Uuid]) -> Result<HashMap<Uuid, u64>, StoreError>;
}

// ---------------------------------------------------------------------------
// Enum <-> TEXT column helpers
// ---------------------------------------------------------------------------

fn enum_to_column<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value).expect("run enum always serializes") {
        Value::String(s) => s,
        other => unreachable!("run enum serialized to non-string JSON: {other:?}"),
    }
}

fn column_to_enum<T: for<'de> Deserialize<'de>>(column: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(column.to_string()))
        .map_err(|e| StoreError::ConstraintViolation(format!("bad enum column {column:?}: {e}")))
}

// ---------------------------------------------------------------------------
// PgRunStore
// ---------------------------------------------------------------------------

/// Production [`RunStore`] over PostgreSQL, chosen for native `JSONB`
/// support matching any SQL database with JSON-column support.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the crate's bundled schema migration. Call once at startup,
    /// before serving traffic.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("applying agentspy-store migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::ConstraintViolation(e.to_string()))
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<Run, StoreError> {
        let run_type: String = row.try_get("run_type")?;
        let status: String = row.try_get("status")?;
        let events: Value = row.try_get("events")?;
        let tags: Value = row.try_get("tags")?;

        let events = match events {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let tags: BTreeSet<String> = match tags {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => BTreeSet::new(),
        };

        Ok(Run {
            id: row.try_get("id")?,
            trace_id: row.try_get("trace_id")?,
            parent_run_id: row.try_get("parent_run_id")?,
            name: row.try_get("name")?,
            run_type: column_to_enum::<RunType>(&run_type)?,
            status: column_to_enum::<RunStatus>(&status)?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            extra: row.try_get("extra")?,
            serialized: row.try_get("serialized")?,
            events,
            error: row.try_get("error")?,
            tags,
            reference_example_id: row.try_get("reference_example_id")?,
            project_name: row.try_get("project_name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn upsert_runs(&self, rows: &[Run]) -> Result<Vec<UpsertResult>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(batch_size = rows.len(), "upserting run batch");
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(rows.len());

        for run in rows {
            let tags: Vec<&str> = run.tags.iter().map(String::as_str).collect();
            let row = sqlx::query(
                r#"
                INSERT INTO runs (
                    id, trace_id, parent_run_id, name, run_type, status,
                    start_time, end_time, inputs, outputs, extra, serialized,
                    events, error, tags, reference_example_id, project_name,
                    created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19
                )
                ON CONFLICT (id) DO UPDATE SET
                    trace_id = excluded.trace_id,
                    parent_run_id = excluded.parent_run_id,
                    name = excluded.name,
                    run_type = excluded.run_type,
                    status = excluded.status,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    inputs = excluded.inputs,
                    outputs = excluded.outputs,
                    extra = excluded.extra,
                    serialized = excluded.serialized,
                    events = excluded.events,
                    error = excluded.error,
                    tags = excluded.tags,
                    reference_example_id = excluded.reference_example_id,
                    project_name = excluded.project_name,
                    updated_at = excluded.updated_at
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(run.id)
            .bind(run.trace_id)
            .bind(run.parent_run_id)
            .bind(&run.name)
            .bind(enum_to_column(&run.run_type))
            .bind(enum_to_column(&run.status))
            .bind(run.start_time)
            .bind(run.end_time)
            .bind(&run.inputs)
            .bind(&run.outputs)
            .bind(&run.extra)
            .bind(&run.serialized)
            .bind(Value::Array(run.events.clone()))
            .bind(&run.error)
            .bind(Value::from(tags))
            .bind(run.reference_example_id)
            .bind(&run.project_name)
            .bind(run.created_at)
            .bind(run.updated_at)
            .fetch_one(&mut *tx)
            .await?;

            let inserted: bool = row.try_get("inserted")?;
            results.push(UpsertResult {
                id: run.id,
                outcome: if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                },
            });
        }

        tx.commit().await?;
        Ok(results)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn get_children(&self, parent_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query("SELECT * FROM runs WHERE parent_run_id = $1 ORDER BY start_time ASC")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn get_subtree(&self, root_id: Uuid, max_depth: usize) -> Result<Vec<Run>, StoreError> {
        bfs_subtree(self, root_id, max_depth).await
    }

    async fn list_roots(&self, filter: &RootFilter, page: PageRequest) -> Result<Page<Run>, StoreError> {
        let mut sql = String::from("SELECT * FROM runs WHERE parent_run_id IS NULL");
        let mut count_sql = String::from("SELECT COUNT(*) FROM runs WHERE parent_run_id IS NULL");
        let mut clauses = Vec::new();
        let mut idx = 1;
        if filter.project_name.is_some() {
            clauses.push(format!("project_name = ${idx}"));
            idx += 1;
        }
        if filter.status.is_some() {
            clauses.push(format!("status = ${idx}"));
            idx += 1;
        }
        if filter.search.is_some() {
            clauses.push(format!("name ILIKE ${idx}"));
            idx += 1;
        }
        if filter.start_time_gte.is_some() {
            clauses.push(format!("start_time >= ${idx}"));
            idx += 1;
        }
        if filter.start_time_lte.is_some() {
            clauses.push(format!("start_time <= ${idx}"));
            idx += 1;
        }
        for clause in &clauses {
            sql.push_str(" AND ");
            sql.push_str(clause);
            count_sql.push_str(" AND ");
            count_sql.push_str(clause);
        }
        sql.push_str(&format!(
            " ORDER BY start_time DESC LIMIT ${idx} OFFSET ${}",
            idx + 1
        ));

        fn bind_filter<'q>(
            mut q: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
            filter: &'q RootFilter,
        ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
            if let Some(project) = &filter.project_name {
                q = q.bind(project.as_str());
            }
            if let Some(status) = filter.status {
                q = q.bind(enum_to_column(&status));
            }
            if let Some(search) = &filter.search {
                q = q.bind(format!("%{search}%"));
            }
            if let Some(gte) = filter.start_time_gte {
                q = q.bind(gte);
            }
            if let Some(lte) = filter.start_time_lte {
                q = q.bind(lte);
            }
            q
        }

        let count_row = bind_filter(sqlx::query(&count_sql), filter)
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = count_row.try_get(0)?;

        let data_query = bind_filter(sqlx::query(&sql), filter)
            .bind(page.limit as i64)
            .bind(page.offset as i64);
        let rows = data_query.fetch_all(&self.pool).await?;
        let items = rows.iter().map(Self::row_to_run).collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
        })
    }

    async fn aggregate_stats(&self, recency_window: Duration) -> Result<AggregateStats, StoreError> {
        let total_row = sqlx::query("SELECT COUNT(*) FROM runs")
            .fetch_one(&self.pool)
            .await?;
        let total_runs: i64 = total_row.try_get(0)?;

        let since = Utc::now() - recency_window;
        let recent_row = sqlx::query("SELECT COUNT(*) FROM runs WHERE start_time >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        let recent_count: i64 = recent_row.try_get(0)?;

        let status_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM runs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut status_distribution = BTreeMap::new();
        for row in status_rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            status_distribution.insert(status, n.max(0) as u64);
        }

        let type_rows = sqlx::query("SELECT run_type, COUNT(*) AS n FROM runs GROUP BY run_type")
            .fetch_all(&self.pool)
            .await?;
        let mut run_type_distribution = BTreeMap::new();
        for row in type_rows {
            let run_type: String = row.try_get("run_type")?;
            let n: i64 = row.try_get("n")?;
            run_type_distribution.insert(run_type, n.max(0) as u64);
        }

        let project_rows =
            sqlx::query("SELECT COALESCE(project_name, '') AS project_name, COUNT(*) AS n FROM runs GROUP BY project_name")
                .fetch_all(&self.pool)
                .await?;
        let mut project_distribution = BTreeMap::new();
        for row in project_rows {
            let project: String = row.try_get("project_name")?;
            let n: i64 = row.try_get("n")?;
            project_distribution.insert(project, n.max(0) as u64);
        }

        Ok(AggregateStats {
            total_runs: total_runs.max(0) as u64,
            status_distribution,
            run_type_distribution,
            project_distribution,
            recent_count: recent_count.max(0) as u64,
        })
    }

    async fn scan_incomplete(&self, window: Duration) -> Result<Vec<Run>, StoreError> {
        let since = Utc::now() - window;
        let rows = sqlx::query("SELECT * FROM runs WHERE updated_at >= $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn count_children(&self, parent_ids: &[Uuid]) -> Result<HashMap<Uuid, u64>, StoreError> {
        if parent_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT parent_run_id, COUNT(*) AS n FROM runs WHERE parent_run_id = ANY($1) GROUP BY parent_run_id",
        )
        .bind(parent_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::new();
        for row in rows {
            let parent: Uuid = row.try_get("parent_run_id")?;
            let n: i64 = row.try_get("n")?;
            out.insert(parent, n.max(0) as u64);
        }
        Ok(out)
    }
}

/// Iterative BFS over [`RunStore::get_children`], shared by every
/// [`RunStore`] implementation so the traversal bound (`max_depth`) and
/// cycle tolerance live in one place.
async fn bfs_subtree(store: &dyn RunStore, root_id: Uuid, max_depth: usize) -> Result<Vec<Run>, StoreError> {
    let mut out = Vec::new();
    let mut frontier = vec![root_id];
    let mut visited = std::collections::HashSet::new();
    visited.insert(root_id);

    for _ in 0..=max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut next_frontier = Vec::new();
        for parent in frontier {
            let children = store.get_children(parent).await?;
            for child in children {
                if visited.insert(child.id) {
                    next_frontier.push(child.id);
                    out.push(child);
                }
            }
        }
        frontier = next_frontier;
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// InMemoryRunStore
// ---------------------------------------------------------------------------

/// In-process [`RunStore`] fake. Backs unit tests for the repository (C2)
/// without a live database; also useful for the daemon's own smoke tests.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    rows: Arc<RwLock<BTreeMap<Uuid, Run>>>,
}

impl InMemoryRunStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn upsert_runs(&self, rows: &[Run]) -> Result<Vec<UpsertResult>, StoreError> {
        let mut guard = self.rows.write().await;
        let mut results = Vec::with_capacity(rows.len());
        for run in rows {
            let outcome = if guard.contains_key(&run.id) {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Inserted
            };
            guard.insert(run.id, run.clone());
            results.push(UpsertResult {
                id: run.id,
                outcome,
            });
        }
        Ok(results)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn get_children(&self, parent_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let mut children: Vec<Run> = self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.parent_run_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.start_time);
        Ok(children)
    }

    async fn get_subtree(&self, root_id: Uuid, max_depth: usize) -> Result<Vec<Run>, StoreError> {
        bfs_subtree(self, root_id, max_depth).await
    }

    async fn list_roots(&self, filter: &RootFilter, page: PageRequest) -> Result<Page<Run>, StoreError> {
        let guard = self.rows.read().await;
        let mut matches: Vec<Run> = guard
            .values()
            .filter(|r| r.parent_run_id.is_none())
            .filter(|r| {
                filter
                    .project_name
                    .as_ref()
                    .is_none_or(|p| r.project_name.as_deref() == Some(p.as_str()))
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                filter
                    .search
                    .as_ref()
                    .is_none_or(|s| r.name.to_lowercase().contains(&s.to_lowercase()))
            })
            .filter(|r| filter.start_time_gte.is_none_or(|gte| r.start_time >= gte))
            .filter(|r| filter.start_time_lte.is_none_or(|lte| r.start_time <= lte))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn aggregate_stats(&self, recency_window: Duration) -> Result<AggregateStats, StoreError> {
        let guard = self.rows.read().await;
        let since = Utc::now() - recency_window;
        let mut stats = AggregateStats {
            total_runs: guard.len() as u64,
            ..Default::default()
        };
        for run in guard.values() {
            *stats
                .status_distribution
                .entry(enum_to_column(&run.status))
                .or_insert(0) += 1;
            *stats
                .run_type_distribution
                .entry(enum_to_column(&run.run_type))
                .or_insert(0) += 1;
            *stats
                .project_distribution
                .entry(run.project_name.clone().unwrap_or_default())
                .or_insert(0) += 1;
            if run.start_time >= since {
                stats.recent_count += 1;
            }
        }
        Ok(stats)
    }

    async fn scan_incomplete(&self, window: Duration) -> Result<Vec<Run>, StoreError> {
        let since = Utc::now() - window;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn count_children(&self, parent_ids: &[Uuid]) -> Result<HashMap<Uuid, u64>, StoreError> {
        let guard = self.rows.read().await;
        let mut out = HashMap::new();
        for run in guard.values() {
            if let Some(parent) = run.parent_run_id {
                if parent_ids.contains(&parent) {
                    *out.entry(parent).or_insert(0) += 1;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspy_core::{NewRun, RunPatch};

    fn make_run(id: Uuid, parent: Option<Uuid>, name: &str, now: DateTime<Utc>) -> Run {
        let mut run = Run::create(
            NewRun {
                id,
                name: name.into(),
                run_type: RunType::Chain,
                start_time: now,
            },
            &RunPatch::empty(id),
            now,
        );
        run.parent_run_id = parent;
        run
    }

    #[tokio::test]
    async fn upsert_reports_insert_then_update() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = make_run(Uuid::new_v4(), None, "root", now);

        let first = store.upsert_runs(&[run.clone()]).await.unwrap();
        assert_eq!(first[0].outcome, UpsertOutcome::Inserted);

        let second = store.upsert_runs(&[run]).await.unwrap();
        assert_eq!(second[0].outcome, UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn get_subtree_bfs_respects_max_depth() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        let grandchild = Uuid::new_v4();

        store
            .upsert_runs(&[
                make_run(root, None, "root", now),
                make_run(child, Some(root), "child", now),
                make_run(grandchild, Some(child), "grandchild", now),
            ])
            .await
            .unwrap();

        let shallow = store.get_subtree(root, 1).await.unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].id, child);

        let deep = store.get_subtree(root, 2).await.unwrap();
        assert_eq!(deep.len(), 2);
    }

    #[tokio::test]
    async fn list_roots_filters_by_project_and_search() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let mut a = make_run(Uuid::new_v4(), None, "alpha-run", now);
        a.project_name = Some("p1".into());
        let mut b = make_run(Uuid::new_v4(), None, "beta-run", now);
        b.project_name = Some("p2".into());
        store.upsert_runs(&[a, b]).await.unwrap();

        let page = store
            .list_roots(
                &RootFilter {
                    project_name: Some("p1".into()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].name, "alpha-run");

        let search_page = store
            .list_roots(
                &RootFilter {
                    search: Some("BETA".into()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(search_page.total, 1);
        assert_eq!(search_page.items[0].name, "beta-run");
    }

    #[tokio::test]
    async fn count_children_avoids_n_plus_one() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let root = Uuid::new_v4();
        store
            .upsert_runs(&[
                make_run(root, None, "root", now),
                make_run(Uuid::new_v4(), Some(root), "c1", now),
                make_run(Uuid::new_v4(), Some(root), "c2", now),
            ])
            .await
            .unwrap();

        let counts = store.count_children(&[root]).await.unwrap();
        assert_eq!(counts.get(&root), Some(&2));
    }
}
