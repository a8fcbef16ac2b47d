//! Shared field mapping from wire formats into [`NewRun`]/[`RunPatch`]
//! pairs. Every receiver funnels through here so the three protocols stay
//! behaviorally identical once a row reaches the repository.

use agentspy_core::{NewRun, RunPatch, RunType};
use chrono::{DateTime, TimeZone, Utc};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value::Value as AnyValueKind};
use opentelemetry_proto::tonic::trace::v1::{Span, span::SpanKind, status::StatusCode};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Namespace for the UUIDv5 derivation of run ids from OTLP span ids.
/// Arbitrary but fixed: an OTLP `span_id` is only 8 bytes and unique
/// within a trace, not globally, so two unrelated traces can reuse the
/// same span id. Hashing `(trace_id, span_id)` together under a stable
/// namespace turns that into a globally-unique, deterministic run id
/// without needing a lookup table.
const OTLP_NAMESPACE: Uuid = Uuid::from_bytes([
    0xa9, 0x3e, 0x4b, 0x7c, 0x1d, 0x52, 0x4b, 0x8a, 0x9e, 0x31, 0x6f, 0x0c, 0x2d, 0x77, 0x91, 0x08,
]);

/// Derives a run id from an OTLP `(trace_id, span_id)` pair.
pub fn span_run_id(trace_id: &[u8], span_id: &[u8]) -> Uuid {
    let mut bytes = Vec::with_capacity(trace_id.len() + span_id.len());
    bytes.extend_from_slice(trace_id);
    bytes.extend_from_slice(span_id);
    Uuid::new_v5(&OTLP_NAMESPACE, &bytes)
}

/// Derives this system's `trace_id` from an OTLP trace id.
pub fn trace_run_id(trace_id: &[u8]) -> Uuid {
    Uuid::new_v5(&OTLP_NAMESPACE, trace_id)
}

fn unix_nano_to_datetime(nanos: u64) -> DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as i64;
    let nsec = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, nsec).single().unwrap_or_else(Utc::now)
}

fn any_value_to_json(value: &AnyValue) -> Value {
    match &value.value {
        Some(AnyValueKind::StringValue(s)) => json!(s),
        Some(AnyValueKind::BoolValue(b)) => json!(b),
        Some(AnyValueKind::IntValue(i)) => json!(i),
        Some(AnyValueKind::DoubleValue(d)) => json!(d),
        Some(AnyValueKind::BytesValue(b)) => json!(hex::encode(b)),
        Some(AnyValueKind::ArrayValue(arr)) => {
            Value::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(AnyValueKind::KvlistValue(kv)) => Value::Object(kv_list_to_map(&kv.values)),
        None => Value::Null,
    }
}

fn kv_list_to_map(attrs: &[KeyValue]) -> Map<String, Value> {
    attrs
        .iter()
        .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), any_value_to_json(v))))
        .collect()
}

fn find_attribute<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a AnyValue> {
    attrs.iter().find(|kv| kv.key == key).and_then(|kv| kv.value.as_ref())
}

fn service_name(resource_attrs: &[KeyValue]) -> Option<String> {
    match find_attribute(resource_attrs, "service.name").map(|v| &v.value) {
        Some(Some(AnyValueKind::StringValue(s))) => Some(s.clone()),
        _ => None,
    }
}

/// [`RunType`] for an OTLP span's kind, refined by the
/// `gen_ai.request.model` semantic-convention attribute where present
/// (OTLP's `kind` alone can't distinguish an LLM call from any other
/// client span, and the dashboard benefits from surfacing it precisely).
fn run_type_for_span(span: &Span) -> RunType {
    if find_attribute(&span.attributes, "gen_ai.request.model").is_some() {
        return RunType::Llm;
    }
    match SpanKind::try_from(span.kind).unwrap_or(SpanKind::Unspecified) {
        SpanKind::Internal => RunType::Internal,
        SpanKind::Client => RunType::Tool,
        SpanKind::Server => RunType::Chain,
        SpanKind::Producer => RunType::Llm,
        SpanKind::Consumer => RunType::Retrieval,
        SpanKind::Unspecified => RunType::Custom,
    }
}

/// Canonicalizes one OTLP span (plus its resource's attributes) into a
/// `(NewRun, RunPatch)` pair ready for [`agentspy_repository::IngestBatch`].
///
/// OTLP spans carry no explicit `outputs`/`error` split the way LangSmith
/// runs do, so the span's own status code stands in for both: `Error`
/// becomes `error`, `Ok` folds the span's attributes into `outputs`, and
/// `Unset` leaves both empty so derivation keeps the run at `running` —
/// an ended span with no verdict either way isn't done, it's incomplete.
pub fn span_to_run(resource_attrs: &[KeyValue], span: &Span) -> (NewRun, RunPatch) {
    let id = span_run_id(&span.trace_id, &span.span_id);
    let trace_id = trace_run_id(&span.trace_id);
    let start_time = unix_nano_to_datetime(span.start_time_unix_nano);
    let end_time = (span.end_time_unix_nano > 0).then(|| unix_nano_to_datetime(span.end_time_unix_nano));

    let new = NewRun {
        id,
        name: span.name.clone(),
        run_type: run_type_for_span(span),
        start_time,
    };

    let mut patch = RunPatch::empty(id);
    patch.trace_id = Some(Some(trace_id));
    patch.parent_run_id = if span.parent_span_id.is_empty() {
        Some(None)
    } else {
        Some(Some(span_run_id(&span.trace_id, &span.parent_span_id)))
    };
    patch.end_time = end_time.map(Some);
    patch.project_name = service_name(resource_attrs).map(Some);

    if !span.attributes.is_empty() {
        patch.extra = Some(Some(json!({
            "otlp": { "attributes": kv_list_to_map(&span.attributes) },
        })));
    }

    if end_time.is_some() {
        let status_code = span
            .status
            .as_ref()
            .and_then(|s| StatusCode::try_from(s.code).ok())
            .unwrap_or(StatusCode::Unset);
        match status_code {
            StatusCode::Error => {
                let message = span.status.as_ref().map(|s| s.message.clone()).unwrap_or_default();
                patch.error = Some(Some(if message.is_empty() {
                    "span status is error".to_string()
                } else {
                    message
                }));
            }
            StatusCode::Ok => {
                patch.outputs = Some(Some(json!({
                    "attributes": kv_list_to_map(&span.attributes),
                })));
            }
            StatusCode::Unset => {
                // No outputs/error means derivation keeps this run at
                // `running` even though the span has ended; it surfaces
                // later as a completeness anomaly rather than a false
                // `completed`.
            }
        }
    }

    if !span.events.is_empty() {
        patch.events = span
            .events
            .iter()
            .map(|event| {
                json!({
                    "name": event.name,
                    "time_unix_nano": event.time_unix_nano,
                    "attributes": kv_list_to_map(&event.attributes),
                })
            })
            .collect();
    }

    let tags: BTreeSet<String> = span
        .attributes
        .iter()
        .filter(|kv| kv.key == "tag")
        .filter_map(|kv| match kv.value.as_ref().map(|v| &v.value) {
            Some(Some(AnyValueKind::StringValue(s))) => Some(s.clone()),
            _ => None,
        })
        .collect();
    if !tags.is_empty() {
        patch.tags = Some(tags);
    }

    (new, patch)
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}
