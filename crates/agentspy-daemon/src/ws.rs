// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket endpoint: clients connect at `/ws`, receive a one-shot `hello`
//! frame, then send `{op: "subscribe"|"unsubscribe", events: [...]}` control
//! messages to adjust their filter. The server pushes typed [`Event`]
//! frames as they're published, plus a periodic `ping` to detect
//! half-open connections.

use crate::AppState;
use agentspy_hub::EventType;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::interval;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-to-server control frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientOp {
    Subscribe { events: Vec<EventType> },
    Unsubscribe { events: Vec<EventType> },
}

/// `GET /ws` upgrade entrypoint.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.repo.hub();
    let subscriber_id = hub.subscribe(std::iter::empty::<EventType>()).await;

    let (mut sender, mut receiver) = socket.split();

    let hello = json!({
        "type": "hello",
        "server_version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
        "data": { "subscriber_id": subscriber_id.to_string() },
    });
    if sender.send(Message::Text(hello.to_string().into())).await.is_err() {
        hub.unsubscribe(subscriber_id).await;
        return;
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            event = hub.recv(subscriber_id) => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !apply_control_message(hub, subscriber_id, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = heartbeat.tick() => {
                let ping = json!({ "type": "ping", "timestamp": chrono::Utc::now() });
                if sender.send(Message::Text(ping.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.unsubscribe(subscriber_id).await;
}

/// Applies one decoded control frame. Malformed JSON is ignored rather than
/// closing the connection; an unknown `op` value behaves the same way via
/// serde's untagged failure. Returns `false` only when the connection
/// itself should be torn down (never, today — reserved for future
/// protocol-violation handling).
async fn apply_control_message(hub: &agentspy_hub::EventHub, id: agentspy_hub::SubscriberId, text: &str) -> bool {
    match serde_json::from_str::<ClientOp>(text) {
        Ok(ClientOp::Subscribe { events }) => hub.add_interest(id, events).await,
        Ok(ClientOp::Unsubscribe { events }) => hub.remove_interest(id, events).await,
        Err(e) => tracing::debug!(error = %e, "ignoring malformed websocket control frame"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_app;
    use agentspy_config::AppConfig;
    use agentspy_core::{NewRun, RunPatch, RunType};
    use agentspy_hub::EventHub;
    use agentspy_repository::{IngestBatch, RunRepository};
    use agentspy_store::InMemoryRunStore;
    use chrono::Utc;
    use futures::{SinkExt as _, StreamExt as _};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            otlp_grpc_enabled: false,
            otlp_grpc_port: 4317,
            otlp_http_path: "/v1/traces".into(),
            database_url: "sqlite::memory:".into(),
            database_pool_size: 5,
            max_trace_size_mb: 10,
            request_timeout_secs: 30,
            require_auth: false,
            api_keys: String::new(),
            cors_origins: "*".into(),
            log_level: "info".into(),
            log_format: agentspy_config::LogFormat::Json,
        }
    }

    async fn spawn_server(repo: Arc<RunRepository>) -> SocketAddr {
        let state = AppState {
            repo,
            config: Arc::new(test_config()),
        };
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn subscriber_receives_hello_then_filtered_events() {
        let store = Arc::new(InMemoryRunStore::new());
        let hub = EventHub::new(256);
        let repo = Arc::new(RunRepository::new(store, hub));
        let addr = spawn_server(repo.clone()).await;

        let (ws_stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut write, mut read) = ws_stream.split();

        let hello = read.next().await.unwrap().unwrap();
        let WsMessage::Text(hello_text) = hello else { panic!("expected text frame") };
        let hello_parsed: serde_json::Value = serde_json::from_str(&hello_text).unwrap();
        assert_eq!(hello_parsed["type"], "hello");
        assert_eq!(hello_parsed["server_version"], env!("CARGO_PKG_VERSION"));

        write
            .send(WsMessage::Text(
                json!({"op": "subscribe", "events": ["trace.created"]}).to_string().into(),
            ))
            .await
            .unwrap();

        // give the control frame a moment to register before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;

        let run_id = Uuid::new_v4();
        let now = Utc::now();
        repo.ingest_batch(
            IngestBatch {
                posts: vec![(
                    NewRun {
                        id: run_id,
                        name: "root".into(),
                        run_type: RunType::Chain,
                        start_time: now,
                    },
                    RunPatch::empty(run_id),
                )],
                patches: vec![],
                source: agentspy_hub::EventSource::Langsmith,
            },
            now,
        )
        .await
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("event should arrive")
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = frame else { panic!("expected text frame") };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "trace.created");
    }
}
