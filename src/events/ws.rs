//! Dashboard WebSocket: snapshot on connect, then live events.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::model::DashboardEvent;
use crate::api::AppState;

pub async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Dashboard client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_event(socket: &mut WebSocket, event: &DashboardEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize dashboard event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before taking the snapshot so nothing falls in between.
    let mut rx = state.events.subscribe();
    if !send_event(&mut socket, &state.snapshot().await).await {
        warn!("Failed to send initial snapshot, client disconnected");
        return;
    }
    info!(subscribers = state.events.subscriber_count(), "Dashboard client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Dashboard client lagged, resyncing");
                        if !send_event(&mut socket, &state.snapshot().await).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event hub closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Dashboard WebSocket error");
                        break;
                    }
                    // The dashboard stream is one-way.
                    _ => {}
                }
            }
        }
    }

    info!("Dashboard client disconnected");
}
