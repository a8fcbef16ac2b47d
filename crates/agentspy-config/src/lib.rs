// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and defaults for the Agent Spy
//! daemon. Every flag doubles as an environment variable (`clap`'s `env`
//! feature), parsed once at startup into an immutable [`AppConfig`]
//! snapshot.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use clap::Parser;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration validation. A `ConfigError`
/// at startup is fatal: exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Auth is disabled; any client can ingest or read.
    AuthDisabled,
    /// CORS is wide open.
    CorsWildcard,
    /// The configured pool size is unusually small for production traffic.
    SmallPoolSize {
        /// The configured size.
        size: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::AuthDisabled => {
                write!(f, "REQUIRE_AUTH is false; all receivers and query endpoints are unauthenticated")
            }
            ConfigWarning::CorsWildcard => {
                write!(f, "CORS_ORIGINS is '*'; any origin may read dashboard data")
            }
            ConfigWarning::SmallPoolSize { size } => {
                write!(f, "DATABASE_POOL_SIZE={size} is small for sustained ingest traffic")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Recognised log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, single-line-per-event.
    Text,
    /// One JSON object per log line.
    Json,
}

/// Top-level runtime configuration for the Agent Spy daemon, parsed from
/// CLI flags / environment variables.
#[derive(Debug, Clone, Parser, Serialize, Deserialize, JsonSchema)]
#[command(name = "agent-spy", about = "Self-hosted observability backend for AI-agent traces")]
pub struct AppConfig {
    /// Bind address for the HTTP surface (REST + OTLP/HTTP + WebSocket).
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Whether to start the OTLP/gRPC receiver.
    #[arg(long, env = "OTLP_GRPC_ENABLED", default_value_t = true)]
    pub otlp_grpc_enabled: bool,

    /// Dedicated port for the OTLP/gRPC receiver.
    #[arg(long, env = "OTLP_GRPC_PORT", default_value_t = 4317)]
    pub otlp_grpc_port: u16,

    /// Path for the OTLP/HTTP receiver.
    #[arg(long, env = "OTLP_HTTP_PATH", default_value = "/v1/traces")]
    pub otlp_http_path: String,

    /// Database connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Connection pool size.
    #[arg(long, env = "DATABASE_POOL_SIZE", default_value_t = 20)]
    pub database_pool_size: u32,

    /// Single-payload cap, in MiB.
    #[arg(long, env = "MAX_TRACE_SIZE_MB", default_value_t = 10)]
    pub max_trace_size_mb: u64,

    /// Per-request deadline, in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Reject unauthenticated calls when true.
    #[arg(long, env = "REQUIRE_AUTH", default_value_t = false)]
    pub require_auth: bool,

    /// Comma-separated valid API keys.
    #[arg(long, env = "API_KEYS", default_value = "")]
    pub api_keys: String,

    /// Comma-separated allowed CORS origins, or `*`.
    #[arg(long, env = "CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Minimum log level.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const MAX_POOL_SIZE: u32 = 1_000;
const SMALL_POOL_SIZE_THRESHOLD: u32 = 4;

impl AppConfig {
    /// Parsed, comma-separated API key set. Empty when `api_keys` is blank.
    pub fn api_key_list(&self) -> Vec<&str> {
        self.api_keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parsed, comma-separated CORS origin list. A bare `*` means "any".
    pub fn cors_origin_list(&self) -> Vec<&str> {
        if self.cors_origins.trim() == "*" {
            return vec!["*"];
        }
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (colliding ports, out-of-range sizes, an empty key list while
/// auth is required) are returned as a [`ConfigError::ValidationError`];
/// soft issues come back as warnings and do not block startup.
pub fn validate_config(config: &AppConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
        errors.push(format!("invalid LOG_LEVEL '{}'", config.log_level));
    }

    if config.otlp_grpc_enabled && config.otlp_grpc_port == config.port {
        errors.push(format!(
            "OTLP_GRPC_PORT ({}) must differ from PORT ({})",
            config.otlp_grpc_port, config.port
        ));
    }

    if config.database_pool_size == 0 || config.database_pool_size > MAX_POOL_SIZE {
        errors.push(format!(
            "DATABASE_POOL_SIZE {} out of range (1..{MAX_POOL_SIZE})",
            config.database_pool_size
        ));
    } else if config.database_pool_size < SMALL_POOL_SIZE_THRESHOLD {
        warnings.push(ConfigWarning::SmallPoolSize {
            size: config.database_pool_size,
        });
    }

    if config.max_trace_size_mb == 0 {
        errors.push("MAX_TRACE_SIZE_MB must be at least 1".into());
    }

    if config.require_auth && config.api_key_list().is_empty() {
        errors.push("REQUIRE_AUTH is true but API_KEYS is empty".into());
    }

    if !config.require_auth {
        warnings.push(ConfigWarning::AuthDisabled);
    }
    if config.cors_origin_list() == vec!["*"] {
        warnings.push(ConfigWarning::CorsWildcard);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}
