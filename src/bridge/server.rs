//! WebSocket endpoint for the bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::run_connection;
use super::frame::OutboundFrame;
use super::host::HostCommands;
use crate::config::BridgeSettings;
use crate::error::HubError;

const INBOUND_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 256;

#[derive(Clone)]
struct BridgeState {
    host: Arc<HostCommands>,
    cancel: CancellationToken,
    next_id: Arc<AtomicU64>,
}

/// Build the bridge router: WebSocket on `/` and `/bridge`, plus `/health`.
pub fn bridge_router(host: HostCommands, cancel: CancellationToken) -> Router {
    let state = BridgeState {
        host: Arc::new(host),
        cancel,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    Router::new()
        .route("/", get(ws_handler))
        .route("/bridge", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind the configured address and serve until `cancel` fires.
pub async fn serve_bridge(settings: &BridgeSettings, cancel: CancellationToken) -> crate::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| HubError::Transport("bridge".to_string(), format!("bind {}: {}", addr, e)))?;
    tracing::info!(addr = %addr, "bridge listening");
    serve_on(listener, HostCommands::new(settings.host_commands.clone()), cancel).await
}

/// Serve the bridge on an already-bound listener.
pub async fn serve_on(
    listener: TcpListener,
    host: HostCommands,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let app = bridge_router(host, cancel.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| HubError::Transport("bridge".to_string(), e.to_string()))?;
    tracing::info!("bridge stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BridgeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);

    let ingest = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(connection = id, error = %e, "websocket read failed");
                    break;
                }
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let egress = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    run_connection(id, in_rx, out_tx, state.host, state.cancel.child_token()).await;

    // All senders are gone once the connection returns; let the writer drain.
    if let Err(e) = egress.await {
        tracing::debug!(connection = id, error = %e, "websocket writer ended abnormally");
    }
    ingest.abort();
}
