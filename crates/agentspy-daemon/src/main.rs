// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Entry point for `agent-spy`: parses configuration, opens the database
//! pool and applies migrations, wires the repository and event hub, then
//! serves the HTTP surface and (optionally) the OTLP/gRPC receiver until
//! shutdown.

use agentspy_daemon::{build_app, AppState};
use agentspy_hub::EventHub;
use agentspy_receivers::OtlpGrpcReceiver;
use agentspy_repository::RunRepository;
use agentspy_store::PgRunStore;
use anyhow::{Context, Result};
use clap::Parser as _;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceServiceServer;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Process exit codes, per the EXTERNAL INTERFACES table: `1` for a fatal
/// startup failure (bind/DB), `2` for a configuration validation error.
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_STARTUP_ERROR: i32 = 1;

#[tokio::main]
async fn main() {
    let config = agentspy_config::AppConfig::parse();

    let warnings = match agentspy_config::validate_config(&config) {
        Ok(warnings) => warnings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    init_tracing(&config);

    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "agent-spy exited with a fatal error");
        std::process::exit(EXIT_STARTUP_ERROR);
    }
}

fn init_tracing(config: &agentspy_config::AppConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        agentspy_config::LogFormat::Json => subscriber.json().init(),
        agentspy_config::LogFormat::Text => subscriber.init(),
    }
}

async fn run(config: agentspy_config::AppConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_pool_size)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("connect to database at {}", redact(&config.database_url)))?;

    let store = PgRunStore::new(pool);
    store.run_migrations().await.context("run schema migrations")?;

    let hub = EventHub::default();
    let repo = Arc::new(RunRepository::new(Arc::new(store), hub));
    let config = Arc::new(config);
    let state = AppState {
        repo: repo.clone(),
        config: config.clone(),
    };

    let app = build_app(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "agent-spy HTTP surface listening");

    let http_server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if config.otlp_grpc_enabled {
        let grpc_addr: SocketAddr = format!("{}:{}", config.host, config.otlp_grpc_port)
            .parse()
            .with_context(|| format!("invalid gRPC bind address {}:{}", config.host, config.otlp_grpc_port))?;
        info!(%grpc_addr, "agent-spy OTLP/gRPC receiver listening");

        let grpc_server = tonic::transport::Server::builder()
            .add_service(TraceServiceServer::new(OtlpGrpcReceiver::new(repo.clone())))
            .serve_with_shutdown(grpc_addr, shutdown_signal());

        let (http_result, grpc_result) = tokio::join!(
            async { http_server.await.context("serve HTTP") },
            async { grpc_server.await.context("serve OTLP/gRPC") },
        );
        http_result?;
        grpc_result?;
    } else {
        http_server.await.context("serve HTTP")?;
    }

    info!("agent-spy shut down gracefully");
    Ok(())
}

/// Masks credentials in a connection string before it's ever logged.
fn redact(url: &str) -> String {
    match url.find('@') {
        Some(at) => match url.find("://") {
            Some(scheme_end) => format!("{}://***{}", &url[..scheme_end], &url[at..]),
            None => "***".to_string(),
        },
        None => url.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
