// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for Agent Spy.
//!
//! Every error raised across ingestion, storage, and the event hub carries
//! an [`ErrorKind`] (a stable, machine-readable category matching the six
//! kinds of the error handling design), a human-readable message, optional
//! structured context, and an optional cause chain. Receivers map
//! [`ErrorKind`] to HTTP status codes; the event hub never lets its own
//! failures propagate into this taxonomy (hub failures are logged and
//! counted, never returned to an ingesting client).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The six error kinds from the error handling design.
///
/// These are categories, not type names: a single [`ErrorKind::Retryable`]
/// might originate from a dead database connection or an exhausted pool,
/// but a caller only needs to know "retry with backoff."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad UUID, broken time invariant, oversize payload, schema mismatch.
    /// Always scoped per-row; never aborts an entire batch.
    Validation,
    /// Missing or invalid API key when auth is required.
    Auth,
    /// Requested id does not exist.
    NotFound,
    /// Storage transient, pool exhausted, deadline exceeded. Safe to retry
    /// with backoff.
    Retryable,
    /// Schema corruption, assertion failure. The process keeps running but
    /// alerts via the completeness endpoint.
    Fatal,
    /// A hub subscriber couldn't keep up. Never surfaced to ingesting
    /// clients; logged and counted only.
    BufferOverflow,
}

impl ErrorKind {
    /// Stable `SCREAMING_SNAKE_CASE` code for logs and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Retryable => "RETRYABLE",
            Self::Fatal => "FATAL",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
        }
    }

    /// The HTTP status code this kind maps to for clients that want one.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Retryable => 503,
            Self::Fatal => 500,
            // Never surfaced to a client directly; 500 is the fallback if
            // one somehow leaks into a response path.
            Self::BufferOverflow => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single error occurrence, carrying its [`ErrorKind`], a message, and
/// optional structured context (e.g. the offending row id).
pub struct AgentSpyError {
    /// Stable error category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured diagnostic context (deterministic iteration order).
    pub context: BTreeMap<String, serde_json::Value>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Overrides `kind`'s default HTTP status. Used for the one case the
    /// taxonomy's kind→status table doesn't capture precisely: an oversize
    /// payload is a [`ErrorKind::Validation`] (bad input) but belongs on 413,
    /// not the kind's usual 400.
    pub status_override: Option<u16>,
}

impl AgentSpyError {
    /// Construct a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
            status_override: None,
        }
    }

    /// Shorthand for [`ErrorKind::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// An oversize-payload rejection: a [`ErrorKind::Validation`] error
    /// whose HTTP status is 413 rather than the kind's usual 400.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Validation, message);
        err.status_override = Some(413);
        err
    }

    /// Shorthand for [`ErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for [`ErrorKind::Retryable`].
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    /// Shorthand for [`ErrorKind::Fatal`].
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Attach a key-value diagnostic. Silently skipped if `value` fails to
    /// serialize.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The HTTP status this error maps to: `status_override` when set,
    /// otherwise `kind`'s default.
    pub fn http_status(&self) -> u16 {
        self.status_override.unwrap_or_else(|| self.kind.http_status())
    }
}

impl fmt::Debug for AgentSpyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AgentSpyError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        if let Some(src) = &self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for AgentSpyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AgentSpyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A single row-level failure inside a batch ingest, keyed by the run id
/// (or the raw id string, if it didn't even parse as a UUID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    /// The id the client supplied, verbatim (may not be a valid UUID).
    pub id: String,
    /// Human-readable failure reason.
    pub message: String,
}

impl RowError {
    /// Construct a row error for the given client-supplied id string.
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

#[cfg(feature = "axum")]
mod axum_support {
    use super::{AgentSpyError, ErrorKind};
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use serde_json::json;

    impl IntoResponse for AgentSpyError {
        fn into_response(self) -> Response {
            let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = Json(json!({
                "error": self.message,
                "code": self.kind.code(),
                "context": self.context,
            }));
            (status, body).into_response()
        }
    }

    impl From<ErrorKind> for StatusCode {
        fn from(kind: ErrorKind) -> Self {
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
