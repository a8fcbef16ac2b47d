// SPDX-License-Identifier: MIT OR Apache-2.0
//! Guardrails for untrusted ingest payloads (batch bodies, OTLP attribute
//! blobs, run `inputs`/`outputs`/`extra`/`serialized` fields).

use serde_json::Value;

/// Limits used to validate a JSON payload before it's handed to
/// canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonGuardLimits {
    /// Maximum allowed nesting depth of objects/arrays.
    pub max_depth: usize,
    /// Maximum allowed UTF-8 byte size after JSON serialization.
    pub max_size_bytes: usize,
}

impl JsonGuardLimits {
    /// Constructs new JSON guard limits.
    pub const fn new(max_depth: usize, max_size_bytes: usize) -> Self {
        Self {
            max_depth,
            max_size_bytes,
        }
    }

    /// Limits for a single trace payload, derived from `MAX_TRACE_SIZE_MB`.
    pub const fn for_trace_size_mb(max_trace_size_mb: usize) -> Self {
        Self::new(64, max_trace_size_mb * 1_000_000)
    }

    /// Limits for a whole batch body (`POST /api/v1/runs/batch`), fixed at
    /// ≈20 MiB per the LangSmith-compatible surface.
    pub const fn batch() -> Self {
        Self::new(128, 20 * 1024 * 1024)
    }
}

/// Validates that `value` is a JSON object and does not exceed depth/size
/// constraints.
///
/// Returns a vector of validation errors; empty means the payload passed
/// all checks.
pub fn validate_json_object(value: &Value, limits: JsonGuardLimits) -> Vec<String> {
    let mut errors = Vec::new();

    if !value.is_object() {
        errors.push("payload must be a JSON object".into());
        return errors;
    }

    if exceeds_depth(value, limits.max_depth) {
        errors.push(format!(
            "payload exceeds maximum nesting depth of {}",
            limits.max_depth
        ));
    }

    if value.to_string().len() > limits.max_size_bytes {
        let max_mb = limits.max_size_bytes / 1_000_000;
        if max_mb > 0 {
            errors.push(format!("payload exceeds maximum size of {max_mb}MB"));
        } else {
            errors.push(format!(
                "payload exceeds maximum size of {} bytes",
                limits.max_size_bytes
            ));
        }
    }

    errors
}

/// Validates only the size constraint against a raw byte length, without
/// requiring the body to already be parsed — used at the receiver's body
/// boundary, before JSON decoding, so oversize bodies are rejected (413)
/// without first paying the cost of parsing them.
pub fn exceeds_byte_limit(byte_len: usize, limits: JsonGuardLimits) -> bool {
    byte_len > limits.max_size_bytes
}

/// Returns `true` if `value` exceeds `max_depth` levels of nesting.
fn exceeds_depth(value: &Value, max_depth: usize) -> bool {
    if max_depth == 0 {
        return value.is_object() || value.is_array();
    }
    match value {
        Value::Object(map) => map.values().any(|v| exceeds_depth(v, max_depth - 1)),
        Value::Array(arr) => arr.iter().any(|v| exceeds_depth(v, max_depth - 1)),
        _ => false,
    }
}
