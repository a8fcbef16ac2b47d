// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-repository
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The write and read paths that receivers and the query API actually call
//! (C2). Owns nothing the store or the hub don't already own — it only
//! sequences them: merge incoming rows atop the current state, write the
//! merged rows through [`agentspy_store::RunStore`], then fan out the
//! resulting transitions through [`agentspy_hub::EventHub`]. Hierarchy
//! assembly and the completeness audit live here too, since both are pure
//! read-side compositions of store primitives.

use agentspy_core::{NewRun, Run, RunPatch, RunStatus, RunType};
use agentspy_error::RowError;
use agentspy_hub::{Event, EventData, EventHub, EventSource, EventType};
use agentspy_store::{AggregateStats, Page, PageRequest, RootFilter, RunStore, StoreError, UpsertOutcome};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Errors a repository call can fail with outright (as opposed to the
/// per-row failures [`BatchResult::failures`] collects without aborting).
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The store couldn't service the request at all.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// One batch of incoming rows from a receiver, already canonicalized into
/// core types (mapping wire formats onto them is the receivers' job; this crate only merges and
/// persists).
pub struct IngestBatch {
    /// Brand-new runs, paired with any fields the same call already knows
    /// (LangSmith's batch `post` entries carry both in one object).
    pub posts: Vec<(NewRun, RunPatch)>,
    /// Partial updates to runs that (usually) already exist.
    pub patches: Vec<RunPatch>,
    /// Which receiver produced this batch, for the emitted events' `source`.
    pub source: EventSource,
}

/// Outcome of [`RunRepository::ingest_batch`]: which ids were freshly
/// created, which were updated, and which rows failed validation (the
/// batch still commits every row that passed).
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Ids that did not exist before this call.
    pub created: Vec<Uuid>,
    /// Ids that already existed and were merged.
    pub updated: Vec<Uuid>,
    /// Per-row validation failures. A failure here never rolls back the
    /// rest of the batch.
    pub failures: Vec<RowError>,
}

struct ResolvedRow {
    run: Run,
    prior_status: Option<RunStatus>,
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value).expect("run enum always serializes") {
        serde_json::Value::String(s) => s,
        other => unreachable!("run enum serialized to non-string JSON: {other:?}"),
    }
}

fn merge_patch(mut run: Run, patch: &RunPatch, now: DateTime<Utc>) -> Run {
    run.apply_patch(patch);
    run.recompute_status();
    if let Some(explicit) = patch.status {
        if explicit != run.status {
            tracing::debug!(
                run_id = %run.id,
                requested = ?explicit,
                derived = ?run.status,
                "ignoring client-supplied status that disagrees with the derived value"
            );
        }
    }
    run.updated_at = now;
    run
}

fn to_event_data(run: &Run, source: EventSource) -> EventData {
    EventData {
        trace_id: run.trace_id,
        parent_run_id: run.parent_run_id,
        name: run.name.clone(),
        run_type: enum_str(&run.run_type),
        status: enum_str(&run.status),
        project_name: run.project_name.clone(),
        source,
        duration_ms: run.duration_ms(),
        error: run.error.clone(),
    }
}

/// Binds a store and an event hub into the read/write API the rest of the
/// system calls.
#[derive(Clone)]
pub struct RunRepository {
    store: Arc<dyn RunStore>,
    hub: EventHub,
}

impl RunRepository {
    /// Construct a repository over a store and a hub. Both are cheap to
    /// clone/share, so this takes them by value.
    pub fn new(store: Arc<dyn RunStore>, hub: EventHub) -> Self {
        Self { store, hub }
    }

    /// The event hub this repository publishes to, for wiring a WebSocket
    /// endpoint to the same instance.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Merges, persists, and publishes events for one ingest batch.
    /// Row-level validation failures are collected, not propagated; only a
    /// store failure (the database itself is unavailable) returns `Err`.
    pub async fn ingest_batch(&self, batch: IngestBatch, now: DateTime<Utc>) -> Result<BatchResult, RepositoryError> {
        let mut resolved = Vec::new();
        let mut failures = Vec::new();

        for (new, patch) in &batch.posts {
            let existing = self.store.get_by_id(new.id).await?;
            let (run, prior_status) = match existing {
                Some(existing) => {
                    let prior = existing.status;
                    (merge_patch(existing, patch, now), Some(prior))
                }
                None => (Run::create(new.clone(), patch, now), None),
            };
            push_resolved(&mut resolved, &mut failures, run, prior_status);
        }

        for patch in &batch.patches {
            let existing = self.store.get_by_id(patch.id).await?;
            let (run, prior_status) = match existing {
                Some(existing) => {
                    let prior = existing.status;
                    (merge_patch(existing, patch, now), Some(prior))
                }
                None => {
                    // A patch arrived before its creating post — ingestion
                    // order across receivers and transport hops is not
                    // guaranteed. Synthesize a placeholder row rather than
                    // rejecting the patch; the eventual post (or another
                    // patch) will fill in the rest.
                    let placeholder = NewRun {
                        id: patch.id,
                        name: "(pending)".into(),
                        run_type: RunType::Custom,
                        start_time: now,
                    };
                    (Run::create(placeholder, patch, now), None)
                }
            };
            push_resolved(&mut resolved, &mut failures, run, prior_status);
        }

        let runs: Vec<Run> = resolved.iter().map(|r| r.run.clone()).collect();
        let upserted = self.store.upsert_runs(&runs).await?;

        let mut result = BatchResult {
            failures,
            ..Default::default()
        };

        for (row, outcome) in resolved.iter().zip(upserted.iter()) {
            match outcome.outcome {
                UpsertOutcome::Inserted => {
                    result.created.push(row.run.id);
                    self.publish(EventType::TraceCreated, &row.run, batch.source, now).await;
                }
                UpsertOutcome::Updated => {
                    result.updated.push(row.run.id);
                    let event_type = match (row.prior_status, row.run.status) {
                        (Some(prior), RunStatus::Completed) if prior != RunStatus::Completed => {
                            EventType::TraceCompleted
                        }
                        (Some(prior), RunStatus::Failed) if prior != RunStatus::Failed => EventType::TraceFailed,
                        _ => EventType::TraceUpdated,
                    };
                    self.publish(event_type, &row.run, batch.source, now).await;
                }
            }
        }

        Ok(result)
    }

    async fn publish(&self, event_type: EventType, run: &Run, source: EventSource, now: DateTime<Utc>) {
        self.hub
            .publish(Event::new(event_type, now, to_event_data(run, source)))
            .await;
    }

    /// Fetches a single run by id, with view-only fields attached. `None`
    /// if it doesn't exist.
    pub async fn get_run(&self, id: Uuid) -> Result<Option<RunView>, RepositoryError> {
        let Some(run) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };
        let counts = self.store.count_children(std::slice::from_ref(&id)).await?;
        Ok(Some(RunView {
            duration_ms: run.duration_ms(),
            child_run_count: counts.get(&id).copied().unwrap_or(0),
            run,
        }))
    }

    /// Lists root runs (no parent), with server-computed `duration_ms` and
    /// `child_run_count` attached per row.
    pub async fn get_root_runs(
        &self,
        filter: RootFilter,
        page: PageRequest,
    ) -> Result<Page<RunView>, RepositoryError> {
        let page = self.store.list_roots(&filter, page).await?;
        let ids: Vec<Uuid> = page.items.iter().map(|r| r.id).collect();
        let counts = self.store.count_children(&ids).await?;
        let items = page
            .items
            .into_iter()
            .map(|run| {
                let child_run_count = counts.get(&run.id).copied().unwrap_or(0);
                RunView {
                    duration_ms: run.duration_ms(),
                    child_run_count,
                    run,
                }
            })
            .collect();
        Ok(Page {
            items,
            total: page.total,
        })
    }

    /// Assembles a root run plus its full descendant set (bounded by
    /// `max_depth`), each annotated with view-only fields. `None` if
    /// `root_id` doesn't exist.
    pub async fn get_hierarchy(&self, root_id: Uuid, max_depth: usize) -> Result<Option<RunHierarchy>, RepositoryError> {
        let Some(root) = self.store.get_by_id(root_id).await? else {
            return Ok(None);
        };
        let descendants = self.store.get_subtree(root_id, max_depth).await?;

        let mut all_ids = Vec::with_capacity(descendants.len() + 1);
        all_ids.push(root.id);
        all_ids.extend(descendants.iter().map(|r| r.id));
        let counts = self.store.count_children(&all_ids).await?;

        let root_view = RunView {
            duration_ms: root.duration_ms(),
            child_run_count: counts.get(&root.id).copied().unwrap_or(0),
            run: root,
        };
        let descendants = descendants
            .into_iter()
            .map(|run| RunView {
                duration_ms: run.duration_ms(),
                child_run_count: counts.get(&run.id).copied().unwrap_or(0),
                run,
            })
            .collect();

        let total_runs = 1 + descendants.len() as u64;
        let max_depth = hierarchy_depth(root_id, &descendants);

        Ok(Some(RunHierarchy {
            root: root_view,
            descendants,
            total_runs,
            max_depth,
        }))
    }

    /// Dashboard summary counts.
    pub async fn get_dashboard_stats(&self, recency_window: Duration) -> Result<AggregateStats, RepositoryError> {
        Ok(self.store.aggregate_stats(recency_window).await?)
    }

    /// Scans runs touched within `window` for the three anomaly classes the
    /// completeness endpoint reports.
    pub async fn check_completeness(&self, window: Duration) -> Result<CompletenessReport, RepositoryError> {
        let candidates = self.store.scan_incomplete(window).await?;
        let now = Utc::now();
        let mut anomalies = Vec::new();

        for run in &candidates {
            // Field predicate, not derived status: a run with `end_time` set,
            // no `error`, and no `outputs` is missing outputs whether it's
            // sitting at `running` (never reached a terminal state) or stuck
            // at a sticky `completed` whose `outputs` got cleared by a later
            // patch. Both are the same operator-visible anomaly.
            if run.end_time.is_some() && run.error.is_none() && run.outputs.is_none() {
                anomalies.push(Anomaly {
                    run_id: run.id,
                    kind: AnomalyKind::CompletedMissingOutputs,
                    detail: "end_time is set but outputs is absent and no error occurred".into(),
                });
            } else if run.status == RunStatus::Running
                && run.end_time.is_none()
                && now - run.start_time > Duration::hours(2)
            {
                anomalies.push(Anomaly {
                    run_id: run.id,
                    kind: AnomalyKind::LongRunningPotentialOrphan,
                    detail: format!(
                        "running for {}h with no end_time",
                        (now - run.start_time).num_hours()
                    ),
                });
            }
        }

        Ok(CompletenessReport {
            checked: candidates.len() as u64,
            anomalies,
        })
    }
}

fn push_resolved(resolved: &mut Vec<ResolvedRow>, failures: &mut Vec<RowError>, run: Run, prior_status: Option<RunStatus>) {
    if let Err(e) = run.validate_invariants() {
        failures.push(RowError::new(run.id.to_string(), e.message));
        return;
    }
    resolved.push(ResolvedRow { run, prior_status });
}

// ---------------------------------------------------------------------------
// Read-side view types
// ---------------------------------------------------------------------------

/// A [`Run`] plus the fields only the repository can compute: elapsed
/// duration and direct child count. Never persisted.
#[derive(Debug, Clone)]
pub struct RunView {
    /// The underlying run.
    pub run: Run,
    /// Server-computed duration; `None` while running.
    pub duration_ms: Option<i64>,
    /// Direct child count, for dashboard fan-out display.
    pub child_run_count: u64,
}

/// A root run and every descendant reachable from it, each with view-only
/// fields attached.
#[derive(Debug, Clone)]
pub struct RunHierarchy {
    /// The requested root.
    pub root: RunView,
    /// Every run under the root, in BFS order.
    pub descendants: Vec<RunView>,
    /// `1 + descendants.len()`.
    pub total_runs: u64,
    /// Longest root-to-leaf chain, counted in levels (a childless root is 1).
    pub max_depth: usize,
}

/// Walks `descendants` by `parent_run_id` starting from `root_id` and
/// returns the longest chain length, in levels (root alone counts as 1).
/// `descendants` is assumed reachable from `root_id` (guaranteed by
/// [`crate::RunStore::get_subtree`]'s BFS), so every node resolves to a
/// depth in a single pass over non-decreasing BFS order.
fn hierarchy_depth(root_id: Uuid, descendants: &[RunView]) -> usize {
    let mut depth_of: std::collections::HashMap<Uuid, usize> = std::collections::HashMap::new();
    depth_of.insert(root_id, 1);
    let mut max_depth = 1;
    let mut pending: Vec<&RunView> = descendants.iter().collect();
    while !pending.is_empty() {
        let mut progressed = false;
        pending.retain(|view| {
            let Some(parent_id) = view.run.parent_run_id else {
                return false;
            };
            if let Some(&parent_depth) = depth_of.get(&parent_id) {
                let depth = parent_depth + 1;
                depth_of.insert(view.run.id, depth);
                max_depth = max_depth.max(depth);
                progressed = true;
                false
            } else {
                true
            }
        });
        if !progressed {
            break;
        }
    }
    max_depth
}

/// One of the three anomaly classes the completeness audit reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// `end_time` is set, `error` is absent, `outputs` is absent — whether
    /// the run is still sitting at `running` (never reached a terminal
    /// state) or stuck at a sticky `completed` whose `outputs` got cleared
    /// by a later patch.
    CompletedMissingOutputs,
    /// `end_time` is absent, started more than two hours ago.
    LongRunningPotentialOrphan,
    /// Reserved for a future anomaly class distinct from
    /// `CompletedMissingOutputs`; never produced today, since every run
    /// with `end_time` set and no `error` falls out by whether `outputs`
    /// is present.
    IncompleteCompletion,
}

/// One flagged run from [`RunRepository::check_completeness`].
#[derive(Debug, Clone)]
pub struct Anomaly {
    /// The run id the anomaly is about.
    pub run_id: Uuid,
    /// Which class of anomaly this is.
    pub kind: AnomalyKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Result of a completeness scan.
#[derive(Debug, Clone)]
pub struct CompletenessReport {
    /// How many runs were scanned (matched the recency window).
    pub checked: u64,
    /// Flagged runs, in no particular order.
    pub anomalies: Vec<Anomaly>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspy_core::RunPatch;
    use serde_json::json;

    fn repo() -> RunRepository {
        RunRepository::new(Arc::new(agentspy_store::InMemoryRunStore::new()), EventHub::default())
    }

    fn new_run(id: Uuid, name: &str, now: DateTime<Utc>) -> NewRun {
        NewRun {
            id,
            name: name.into(),
            run_type: RunType::Chain,
            start_time: now,
        }
    }

    #[tokio::test]
    async fn create_then_patch_emits_created_then_completed() {
        let repo = repo();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let sub = repo.hub().subscribe([EventType::TraceCreated, EventType::TraceCompleted]).await;

        let create = repo
            .ingest_batch(
                IngestBatch {
                    posts: vec![(new_run(id, "root", now), RunPatch::empty(id))],
                    patches: vec![],
                    source: EventSource::Langsmith,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(create.created, vec![id]);

        let mut patch = RunPatch::empty(id);
        patch.end_time = Some(Some(now + Duration::seconds(1)));
        patch.outputs = Some(Some(json!({"ok": true})));
        let update = repo
            .ingest_batch(
                IngestBatch {
                    posts: vec![],
                    patches: vec![patch],
                    source: EventSource::Langsmith,
                },
                now + Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(update.updated, vec![id]);

        let created_event = repo.hub().recv(sub).await.unwrap();
        assert_eq!(created_event.event_type, EventType::TraceCreated);
        let completed_event = repo.hub().recv(sub).await.unwrap();
        assert_eq!(completed_event.event_type, EventType::TraceCompleted);
    }

    #[tokio::test]
    async fn out_of_order_patch_synthesizes_placeholder_row() {
        let repo = repo();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let mut patch = RunPatch::empty(id);
        patch.name = Some("late-arriving".into());
        let result = repo
            .ingest_batch(
                IngestBatch {
                    posts: vec![],
                    patches: vec![patch],
                    source: EventSource::OtlpGrpc,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(result.created, vec![id]);
    }

    #[tokio::test]
    async fn invalid_row_fails_without_blocking_the_rest_of_the_batch() {
        let repo = repo();
        let now = Utc::now();
        let good_id = Uuid::new_v4();
        let bad_id = Uuid::new_v4();

        let mut bad_patch = RunPatch::empty(bad_id);
        bad_patch.end_time = Some(Some(now - Duration::hours(1)));

        let result = repo
            .ingest_batch(
                IngestBatch {
                    posts: vec![(new_run(good_id, "good", now), RunPatch::empty(good_id))],
                    patches: vec![bad_patch],
                    source: EventSource::Langsmith,
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(result.created, vec![good_id]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].id, bad_id.to_string());
    }

    #[tokio::test]
    async fn client_supplied_status_never_overrides_derivation() {
        let repo = repo();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let mut patch = RunPatch::empty(id);
        patch.status = Some(RunStatus::Completed);
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(new_run(id, "root", now), patch)],
                patches: vec![],
                source: EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let stored = repo.get_root_runs(RootFilter::default(), PageRequest::default()).await.unwrap();
        assert_eq!(stored.items[0].run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn completeness_flags_completed_run_whose_outputs_were_later_cleared() {
        let repo = repo();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let mut complete_patch = RunPatch::empty(id);
        complete_patch.end_time = Some(Some(now));
        complete_patch.outputs = Some(Some(json!({"ok": true})));
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(new_run(id, "root", now), complete_patch)],
                patches: vec![],
                source: EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let mut clear_patch = RunPatch::empty(id);
        clear_patch.outputs = Some(None);
        repo.ingest_batch(
            IngestBatch {
                posts: vec![],
                patches: vec![clear_patch],
                source: EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let report = repo.check_completeness(Duration::days(1)).await.unwrap();
        assert!(
            report
                .anomalies
                .iter()
                .any(|a| a.run_id == id && a.kind == AnomalyKind::CompletedMissingOutputs)
        );
    }

    #[tokio::test]
    async fn completeness_flags_fresh_runs_with_end_time_but_no_outputs_or_error() {
        let repo = repo();
        let now = Utc::now();

        for i in 0..3u32 {
            let id = Uuid::new_v4();
            let mut patch = RunPatch::empty(id);
            patch.end_time = Some(Some(now));
            repo.ingest_batch(
                IngestBatch {
                    posts: vec![(new_run(id, &format!("stalled-{i}"), now), patch)],
                    patches: vec![],
                    source: EventSource::Langsmith,
                },
                now,
            )
            .await
            .unwrap();
        }

        let report = repo.check_completeness(Duration::days(1)).await.unwrap();
        let completed_missing_outputs = report
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::CompletedMissingOutputs)
            .count();
        assert_eq!(completed_missing_outputs, 3);
    }

    #[tokio::test]
    async fn hierarchy_reports_child_counts() {
        let repo = repo();
        let now = Utc::now();
        let root_id = Uuid::new_v4();
        let child_id = Uuid::new_v4();

        repo.ingest_batch(
            IngestBatch {
                posts: vec![(new_run(root_id, "root", now), RunPatch::empty(root_id))],
                patches: vec![],
                source: EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let mut child_patch = RunPatch::empty(child_id);
        child_patch.parent_run_id = Some(Some(root_id));
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(new_run(child_id, "child", now), child_patch)],
                patches: vec![],
                source: EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let hierarchy = repo.get_hierarchy(root_id, 10).await.unwrap().unwrap();
        assert_eq!(hierarchy.root.child_run_count, 1);
        assert_eq!(hierarchy.descendants.len(), 1);
        assert_eq!(hierarchy.descendants[0].run.id, child_id);
        assert_eq!(hierarchy.total_runs, 2);
        assert_eq!(hierarchy.max_depth, 2);
    }
}
