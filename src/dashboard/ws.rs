//! WebSocket stream: `initial_state` on connect, then every published event.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::notify::DashboardEvent;
use crate::pipeline::Pipeline;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Dashboard client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.pipeline))
}

async fn handle_socket(socket: WebSocket, pipeline: Arc<Pipeline>) {
    // Subscribe before taking the snapshot so nothing published in between is lost.
    let mut rx = pipeline.notifier().subscribe();
    let (mut sender, mut receiver) = socket.split();

    let snapshot = pipeline.initial_state().await;
    if let Some(text) = encode(&snapshot)
        && sender.send(Message::Text(text.into())).await.is_err()
    {
        warn!("Failed to send initial state, client disconnected");
        return;
    }
    info!(subscribers = pipeline.notifier().subscriber_count(), "Dashboard client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                let event = match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Dashboard client lagged, resending snapshot");
                        pipeline.initial_state().await
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                };
                let Some(text) = encode(&event) else { continue };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    debug!("Client disconnected during send");
                    break;
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Dashboard client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // The stream is one-way; commands go through REST.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("Dashboard connection closed");
}

fn encode(event: &DashboardEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event_type = event.event_type(), error = %e, "Failed to encode dashboard event");
            None
        }
    }
}
