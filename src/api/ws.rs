//! Schedule stream over WebSocket.

use std::collections::BTreeMap;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::notifier::{Modification, RunInfo};
use crate::scheduler::{Rid, Scheduler};

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full table; sent on connect and after the client lagged.
    ScheduleSync { schedule: BTreeMap<Rid, RunInfo> },
    Modification { modification: Modification },
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("schedule client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.scheduler))
}

async fn send(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode schedule message");
            true
        }
    }
}

async fn sync(socket: &mut WebSocket, scheduler: &Scheduler) -> bool {
    let schedule = scheduler.get_status().await;
    send(socket, &WsMessage::ScheduleSync { schedule }).await
}

async fn handle_socket(mut socket: WebSocket, scheduler: Scheduler) {
    // Subscribe before the snapshot so no modification falls in between.
    let mut rx = scheduler.subscribe();
    if !sync(&mut socket, &scheduler).await {
        warn!("failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(modification) => {
                        if !send(&mut socket, &WsMessage::Modification { modification }).await {
                            debug!("client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "schedule client lagged behind, re-syncing");
                        if !sync(&mut socket, &scheduler).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("schedule channel closed");
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
                    Some(Ok(Message::Close(_))) | None => {
                        info!("schedule client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("schedule connection closed");
}
