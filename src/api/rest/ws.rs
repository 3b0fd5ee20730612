use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::broadcast::protocol::{ClientMessage, ServerMessage};
use crate::broadcast::registry::SessionId;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the snapshot so no update falls in between.
    let mut events = BroadcastStream::new(state.events_tx.subscribe());
    let (session_id, mut direct) = state.sessions.register(Utc::now());
    state
        .metrics
        .connected_sessions
        .set(state.sessions.len() as i64);

    info!(
        session_id = %session_id,
        sessions = state.sessions.len(),
        "websocket client connected"
    );

    let snapshot = ServerMessage::initial_snapshot(&state.current_summary());
    if send_frame(&mut sender, &snapshot).await.is_ok() {
        loop {
            tokio::select! {
                inbound = receiver.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_text(&state, session_id, &text) {
                            if send_frame(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.sessions.record_activity(session_id, Utc::now());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        debug!(session_id = %session_id, "ignoring binary frame");
                    }
                    Some(Err(err)) => {
                        warn!(session_id = %session_id, error = %err, "websocket receive failed");
                        break;
                    }
                },
                queued = direct.recv() => match queued {
                    Some(message) => {
                        if send_frame(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                    // The registry dropped the session.
                    None => break,
                },
                event = events.next() => match event {
                    Some(Ok(message)) => {
                        if send_frame(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(session_id = %session_id, skipped, "client lagged behind broadcasts");
                    }
                    None => break,
                },
            }
        }
    }

    state.sessions.remove(session_id);
    state
        .metrics
        .connected_sessions
        .set(state.sessions.len() as i64);
    let _ = sender.close().await;

    info!(
        session_id = %session_id,
        sessions = state.sessions.len(),
        "websocket client disconnected"
    );
}

/// Applies one inbound text frame to the session and returns the direct
/// reply, if any.
pub fn handle_client_text(
    state: &AppState,
    session_id: SessionId,
    text: &str,
) -> Option<ServerMessage> {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "dropping malformed client frame");
            return None;
        }
    };

    state.sessions.record_activity(session_id, Utc::now());

    match message {
        ClientMessage::Ping => Some(ServerMessage::pong()),
        ClientMessage::Pong => {
            debug!(session_id = %session_id, "pong received");
            None
        }
        ClientMessage::Init { driver_id } => {
            if let Some(previous) = state.sessions.bind_driver(session_id, driver_id) {
                info!(
                    session_id = %session_id,
                    driver_id,
                    previous = ?previous,
                    "driver bound to session"
                );
            }
            None
        }
        ClientMessage::Unknown => {
            debug!(session_id = %session_id, "ignoring unknown client message type");
            None
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize frame for ws");
            return Ok(());
        }
    };

    sender.send(Message::Text(json.into())).await
}
