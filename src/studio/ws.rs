use axum::{
    extract::{
        Query, State,
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    ProjectCreated {
        project: Project,
    },
    MessageCreated {
        message: Message,
    },
    JobRetrying {
        job_id: String,
        project_id: Option<String>,
        attempts: u32,
        error: String,
    },
    JobFailed {
        job_id: String,
        project_id: Option<String>,
        attempts: u32,
        error: String,
    },
}

impl WsMessage {
    /// Project this event belongs to, used for per-project subscriptions.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::ProjectCreated { project } => Some(&project.id),
            Self::MessageCreated { message } => Some(&message.project_id),
            Self::JobRetrying { project_id, .. } | Self::JobFailed { project_id, .. } => {
                project_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub project_id: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /ws[?project_id=..]`: stream studio events, optionally for one project.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.project_id))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<WsMessage>,
    project_id: Option<String>,
) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, project_id).await;
}

fn wants(filter: Option<&str>, msg: &WsMessage) -> bool {
    match filter {
        None => true,
        Some(id) => msg.project_id() == Some(id),
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, WsFrame>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<WsMessage>,
    project_id: Option<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket pong timeout, closing");
                    break;
                }
                if sender.send(WsFrame::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !wants(project_id.as_deref(), &msg) {
                            continue;
                        }
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize ws message");
                                continue;
                            }
                        };
                        if sender.send(WsFrame::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsFrame::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(WsFrame::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Broadcast a WsMessage to all subscribers. Silent when nobody listens.
pub fn broadcast_message(tx: &broadcast::Sender<WsMessage>, msg: WsMessage) {
    let _ = tx.send(msg);
}

// ── Tests ────────────────────────────────────────────────────────────
