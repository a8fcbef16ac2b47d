// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Agent Spy: the canonical [`Run`] model, its
//! patch/upsert semantics, and status derivation. If you only take one
//! dependency from this workspace, take this one — receivers, the
//! repository, and the store all build on these types.

use agentspy_error::AgentSpyError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// One step of an agent execution: an LLM call, tool call, chain node, or
/// span. The central entity of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    /// Primary key. Supplied by the client (LangSmith) or derived from an
    /// OTLP span id.
    pub id: Uuid,
    /// Root-run grouping. Mirrors LangSmith's `trace_id`; derived from the
    /// OTLP trace id for OTLP sources.
    pub trace_id: Option<Uuid>,
    /// Null means root. Referential integrity is advisory: parents may
    /// arrive after their children.
    pub parent_run_id: Option<Uuid>,
    /// Human label.
    pub name: String,
    /// What kind of step this run represents.
    pub run_type: RunType,
    /// Derived from other fields, see [`derive_status`]. Storage may cache
    /// it but reads must stay consistent with the derivation at steady
    /// state.
    pub status: RunStatus,
    /// UTC start instant.
    pub start_time: DateTime<Utc>,
    /// UTC end instant; null while running.
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque to the core except for presence checks.
    pub inputs: Option<serde_json::Value>,
    /// Opaque to the core except for presence checks.
    pub outputs: Option<serde_json::Value>,
    /// Opaque to the core except for presence checks.
    pub extra: Option<serde_json::Value>,
    /// Opaque to the core except for presence checks.
    pub serialized: Option<serde_json::Value>,
    /// Append-only log of span events, each an opaque JSON object.
    pub events: Vec<serde_json::Value>,
    /// Free-form failure description.
    pub error: Option<String>,
    /// Short string tags.
    pub tags: BTreeSet<String>,
    /// Optional link to a reference example, for evaluation workflows.
    pub reference_example_id: Option<Uuid>,
    /// Logical grouping for dashboards.
    pub project_name: Option<String>,
    /// Server-stamped creation instant. Set once, on first ingest.
    pub created_at: DateTime<Utc>,
    /// Server-stamped, non-decreasing across any sequence of upserts.
    pub updated_at: DateTime<Utc>,
}

/// What kind of step a [`Run`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// A composite/orchestrating node.
    Chain,
    /// An LLM call.
    Llm,
    /// A tool invocation.
    Tool,
    /// A retrieval step (vector search, document fetch).
    Retrieval,
    /// A prompt-template render.
    Prompt,
    /// A parser/output-formatter step.
    Parser,
    /// An embedding call.
    Embedding,
    /// Framework-internal bookkeeping, not user-authored.
    Internal,
    /// Anything the above don't cover.
    Custom,
}

/// Derived lifecycle state of a [`Run`]. See [`derive_status`] for the
/// derivation rule and `apply_upsert` for stickiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No terminal signal yet.
    Running,
    /// `end_time` and `outputs` both present, no error.
    Completed,
    /// `end_time` present and `error` present.
    Failed,
}

impl RunStatus {
    /// Once a run reaches a terminal state it is sticky: later upserts
    /// cannot regress it back to `running` or flip `completed`/`failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// The completion-inference rule.
///
/// ```text
/// if  end_time != null and error != null       -> failed
/// elif end_time != null and outputs != null    -> completed
/// else                                         -> running
/// ```
///
/// Applied on every upsert before event emission, so emitted events always
/// reflect the final state of that write.
pub fn derive_status(
    end_time: Option<&DateTime<Utc>>,
    error: Option<&str>,
    outputs: Option<&serde_json::Value>,
) -> RunStatus {
    if end_time.is_some() && error.is_some() {
        RunStatus::Failed
    } else if end_time.is_some() && outputs.is_some() {
        RunStatus::Completed
    } else {
        RunStatus::Running
    }
}

/// A partial update to a [`Run`], keyed by `id`.
///
/// Nullable fields use `Option<Option<T>>` so that an absent JSON key (outer
/// `None`) is distinguishable from an explicit `null` (`Some(None)`, clears
/// the field) versus an explicit value (`Some(Some(v))`). This distinction
/// is load-bearing: LangSmith-compatible PATCH semantics depend on knowing
/// which fields the client actually touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RunPatch {
    /// Id of the run this patch applies to.
    pub id: Uuid,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub trace_id: Option<Option<Uuid>>,
    /// Absent = untouched; `null` = clear (promote to root); value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub parent_run_id: Option<Option<Uuid>>,
    /// Absent = untouched.
    pub name: Option<String>,
    /// Absent = untouched.
    pub run_type: Option<RunType>,
    /// Absent = untouched. Accepted only when consistent with the derived
    /// status; see the repository's ingest logic for the precedence rule.
    pub status: Option<RunStatus>,
    /// Absent = untouched.
    pub start_time: Option<DateTime<Utc>>,
    /// Absent = untouched; `null` = clear (back to running); value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub end_time: Option<Option<DateTime<Utc>>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub inputs: Option<Option<serde_json::Value>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub outputs: Option<Option<serde_json::Value>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub extra: Option<Option<serde_json::Value>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub serialized: Option<Option<serde_json::Value>>,
    /// New events to append. Events are append-only: a patch never removes
    /// previously recorded events.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub error: Option<Option<String>>,
    /// Absent = untouched; replaces the whole tag set when present.
    pub tags: Option<BTreeSet<String>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub reference_example_id: Option<Option<Uuid>>,
    /// Absent = untouched; `null` = clear; value = set.
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schemars(default)]
    pub project_name: Option<Option<String>>,
}

/// Deserializes a present field (value or `null`) into `Some(Option<T>)`,
/// leaving an absent field at its `#[serde(default)]` of `None`. This is
/// the standard trick for recovering "not set" vs "explicitly null".
fn deserialize_nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::deserialize(deserializer).map(Some)
}

impl RunPatch {
    /// A patch with only the id set; every field absent.
    pub fn empty(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Required fields for constructing a brand-new [`Run`] on first ingest.
/// Everything not listed here is optional and defaults to unset.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Primary key.
    pub id: Uuid,
    /// Human label.
    pub name: String,
    /// What kind of step this run represents.
    pub run_type: RunType,
    /// UTC start instant.
    pub start_time: DateTime<Utc>,
}

impl Run {
    /// Constructs a brand-new run in the `running` state, then immediately
    /// applies `patch` atop it (covers the common case of a LangSmith
    /// `POST /runs/batch` `post` entry, which carries both the required
    /// fields and any already-known optional ones in a single object).
    pub fn create(new: NewRun, patch: &RunPatch, now: DateTime<Utc>) -> Self {
        let mut run = Run {
            id: new.id,
            trace_id: None,
            parent_run_id: None,
            name: new.name,
            run_type: new.run_type,
            status: RunStatus::Running,
            start_time: new.start_time,
            end_time: None,
            inputs: None,
            outputs: None,
            extra: None,
            serialized: None,
            events: Vec::new(),
            error: None,
            tags: BTreeSet::new(),
            reference_example_id: None,
            project_name: None,
            created_at: now,
            updated_at: now,
        };
        run.apply_patch(patch);
        run.recompute_status();
        run
    }

    /// Merges `patch` atop `self`. Absent fields are left untouched;
    /// `Some(None)` clears a nullable field; `Some(Some(v))` sets it.
    /// Does not touch `status` directly and does not recompute it — call
    /// [`Run::recompute_status`] after merging, obeying stickiness.
    pub fn apply_patch(&mut self, patch: &RunPatch) {
        if let Some(trace_id) = patch.trace_id {
            self.trace_id = trace_id;
        }
        if let Some(parent_run_id) = patch.parent_run_id {
            self.parent_run_id = parent_run_id;
        }
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(run_type) = patch.run_type {
            self.run_type = run_type;
        }
        if let Some(start_time) = patch.start_time {
            self.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            self.end_time = end_time;
        }
        if let Some(inputs) = &patch.inputs {
            self.inputs = inputs.clone();
        }
        if let Some(outputs) = &patch.outputs {
            self.outputs = outputs.clone();
        }
        if let Some(extra) = &patch.extra {
            self.extra = extra.clone();
        }
        if let Some(serialized) = &patch.serialized {
            self.serialized = serialized.clone();
        }
        if !patch.events.is_empty() {
            self.events.extend(patch.events.iter().cloned());
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(reference_example_id) = patch.reference_example_id {
            self.reference_example_id = reference_example_id;
        }
        if let Some(project_name) = &patch.project_name {
            self.project_name = project_name.clone();
        }
    }

    /// Recomputes `status` from [`derive_status`], honoring terminal
    /// stickiness: once `completed` or `failed`, a later upsert cannot
    /// regress `status` back to `running` or flip between the two
    /// terminals, even if its own fields would derive differently.
    ///
    /// The one documented exception to "derivation wins": an explicit
    /// `error` on an otherwise-non-terminal run promotes it straight to
    /// `failed`, since an explicit failure signal from the client should
    /// never be held back waiting for `outputs`.
    pub fn recompute_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let derived = derive_status(self.end_time.as_ref(), self.error.as_deref(), self.outputs.as_ref());
        self.status = match derived {
            RunStatus::Running if self.error.is_some() => RunStatus::Failed,
            other => other,
        };
    }

    /// Checks the structural invariants from the data model: `end_time`,
    /// when set, must not precede `start_time`.
    pub fn validate_invariants(&self) -> Result<(), AgentSpyError> {
        if let Some(end_time) = self.end_time {
            if end_time < self.start_time {
                return Err(AgentSpyError::validation(format!(
                    "end_time {end_time} precedes start_time {start} for run {id}",
                    end_time = end_time,
                    start = self.start_time,
                    id = self.id
                ))
                .with_context("run_id", self.id.to_string()));
            }
        }
        Ok(())
    }

    /// Server-computed duration; `None` while running.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// An optional peripheral annotation attached to a run: a score, free-form
/// comment, or correction. Write-only from the API perspective of the
/// core; never affects run status or events.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Feedback {
    /// Primary key.
    pub id: Uuid,
    /// The run this feedback is about.
    pub run_id: Uuid,
    /// Feedback dimension, e.g. `"correctness"` or `"helpfulness"`.
    pub key: String,
    /// Optional numeric score.
    pub score: Option<f64>,
    /// Optional free-form comment.
    pub comment: Option<String>,
    /// Optional suggested correction.
    pub correction: Option<serde_json::Value>,
    /// Optional structured metadata.
    pub metadata: Option<serde_json::Value>,
    /// Server-stamped creation instant.
    pub created_at: DateTime<Utc>,
}
