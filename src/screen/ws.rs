//! Per-runner screen viewer WebSocket. Each message is one binary image.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::Result;

/// Unknown runners get a 404 instead of an upgrade, so viewers cannot
/// allocate frame slots for ids that will never publish.
pub async fn screen_ws(
    ws: WebSocketUpgrade,
    Path(runner_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    state.registry.get(runner_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, runner_id, state)))
}

async fn handle_socket(mut socket: WebSocket, runner_id: Uuid, state: AppState) {
    let mut rx = state.screens.subscribe(runner_id).await;
    info!(runner_id = %runner_id, "Screen viewer connected");

    // Show the current frame straight away; later frames arrive via `changed`.
    let current = rx.borrow_and_update().clone();
    if let Some(frame) = current {
        if socket.send(Message::Binary(frame.data.clone())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!(runner_id = %runner_id, "Screen slot closed");
                    break;
                }
                let latest = rx.borrow_and_update().clone();
                if let Some(frame) = latest {
                    if socket.send(Message::Binary(frame.data.clone())).await.is_err() {
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
                        warn!(error = %e, "Screen WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(runner_id = %runner_id, "Screen viewer disconnected");
}
