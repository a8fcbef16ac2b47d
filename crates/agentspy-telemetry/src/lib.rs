// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Structured telemetry for Agent Spy: ingest-latency percentiles,
//! per-source batch counters, and the hub's dropped-event counter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

// ---------------------------------------------------------------------------
// IngestMetrics / IngestSummary
// ---------------------------------------------------------------------------

/// Metrics captured for a single `ingest_batch` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestMetrics {
    /// Which receiver produced this batch.
    pub source: String,
    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: u64,
    /// Rows in the batch (post + patch combined).
    pub rows_count: u64,
    /// Rows that failed validation.
    pub errors_count: u64,
}

/// Aggregated statistics across recorded ingest calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestSummary {
    /// Number of ingest calls recorded.
    pub count: usize,
    /// Mean call duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) call duration in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th-percentile call duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total rows ingested across all calls.
    pub total_rows: u64,
    /// Row-level error rate (errors / total rows).
    pub error_rate: f64,
    /// Per-source call counts (deterministic ordering).
    pub source_counts: BTreeMap<String, usize>,
}

impl Default for IngestSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_rows: 0,
            error_rate: 0.0,
            source_counts: BTreeMap::new(),
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector for [`IngestMetrics`].
///
/// Wrap in an `Arc` to share across receiver tasks (the inner storage is
/// already behind a `Mutex`).
#[derive(Debug, Clone)]
pub struct IngestMetricsCollector {
    inner: Arc<Mutex<Vec<IngestMetrics>>>,
}

impl Default for IngestMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestMetricsCollector {
    /// Create a new, empty collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a completed ingest call's metrics.
    pub fn record(&self, metrics: IngestMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Number of calls recorded so far.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").len()
    }

    /// Whether the collector has no recorded calls.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded calls.
    pub fn summary(&self) -> IngestSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return IngestSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let total_duration: u64 = durations.iter().sum();
        let mean_duration_ms = total_duration as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);

        let total_rows: u64 = data.iter().map(|r| r.rows_count).sum();
        let total_errors: u64 = data.iter().map(|r| r.errors_count).sum();
        let error_rate = if total_rows == 0 {
            0.0
        } else {
            total_errors as f64 / total_rows as f64
        };

        let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
        for r in data.iter() {
            *source_counts.entry(r.source.clone()).or_insert(0) += 1;
        }

        IngestSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            p99_duration_ms,
            total_rows,
            error_rate,
            source_counts,
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        self.inner.lock().expect("metrics lock poisoned").clear();
    }
}

// ---------------------------------------------------------------------------
// DroppedEventCounter
// ---------------------------------------------------------------------------

/// Process-wide counter of events the hub dropped for overflowing
/// subscriber mailboxes (a full mailbox drops its oldest entry and counts it).
/// Lock-free: a single `AtomicU64`, incremented from the hub's publish
/// path without holding any subscriber lock.
#[derive(Debug, Clone, Default)]
pub struct DroppedEventCounter {
    count: Arc<AtomicU64>,
}

impl DroppedEventCounter {
    /// Create a new counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dropped event.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current total dropped-event count.
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// TelemetrySpan
// ---------------------------------------------------------------------------

/// A structured span for tracing integration, emitted as a single
/// `tracing::info!` event carrying its attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        info!(
            span_name = %self.name,
            attributes = ?self.attributes,
            "telemetry_span"
        );
    }
}

// ---------------------------------------------------------------------------
// Process-wide collector
// ---------------------------------------------------------------------------

static GLOBAL_INGEST_METRICS: OnceLock<IngestMetricsCollector> = OnceLock::new();

/// The single [`IngestMetricsCollector`] shared by every receiver in this
/// process. A receiver records into it right after each `ingest_batch`
/// call; the daemon's telemetry endpoint reads its `summary()`.
pub fn global_ingest_metrics() -> &'static IngestMetricsCollector {
    GLOBAL_INGEST_METRICS.get_or_init(IngestMetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_empty_collector_is_zeroed() {
        let collector = IngestMetricsCollector::new();
        assert_eq!(collector.summary(), IngestSummary::default());
    }

    #[test]
    fn summary_computes_percentiles_and_error_rate() {
        let collector = IngestMetricsCollector::new();
        for (duration, rows, errors) in [(10u64, 5u64, 0u64), (20, 5, 1), (30, 5, 0)] {
            collector.record(IngestMetrics {
                source: "langsmith".into(),
                duration_ms: duration,
                rows_count: rows,
                errors_count: errors,
            });
        }
        let summary = collector.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total_rows, 15);
        assert!((summary.error_rate - (1.0 / 15.0)).abs() < 1e-9);
        assert_eq!(summary.source_counts.get("langsmith"), Some(&3));
    }

    #[test]
    fn dropped_event_counter_increments() {
        let counter = DroppedEventCounter::new();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn dropped_event_counter_clones_share_state() {
        let counter = DroppedEventCounter::new();
        let clone = counter.clone();
        clone.increment();
        assert_eq!(counter.get(), 1);
    }
}
