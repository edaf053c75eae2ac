//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use retro_common::id::{prefix, prefixed_ulid};
use retro_common::ClientEvent;
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::events::{Envelope, Outbound};

/// Close code sent when a client stops answering pings.
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

struct Connection {
    id: String,
    /// Session this connection is bound to, mirrored from the registry.
    bound: Option<String>,
    state: AppState,
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let mut conn = Connection {
        id: prefixed_ulid(prefix::CONNECTION),
        bound: None,
        state,
    };
    // Subscribe before reading anything so no delivery for this connection is missed.
    let fanout_rx = conn.state.fanout.subscribe();
    let (ws_tx, ws_rx) = socket.split();

    tracing::info!(connection_id = %conn.id, "connection opened");
    conn.run(ws_tx, ws_rx, fanout_rx).await;

    let outbound = conn.state.registry.disconnect(&conn.id);
    conn.dispatch(outbound).await;
    tracing::info!(connection_id = %conn.id, "connection closed");
}

impl Connection {
    /// Read client frames, forward fan-out deliveries, enforce heartbeat.
    async fn run(
        &mut self,
        mut ws_tx: SplitSink<WebSocket, Message>,
        mut ws_rx: SplitStream<WebSocket>,
        mut fanout_rx: broadcast::Receiver<Arc<Envelope>>,
    ) {
        let mut heartbeat = time::interval(self.state.config.heartbeat_interval);
        heartbeat.tick().await; // First tick fires immediately; skip it.
        let mut alive = true;

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            alive = true;
                            self.handle_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => alive = true,
                        Some(Err(e)) => {
                            tracing::debug!(?e, connection_id = %self.id, "ws read error");
                            break;
                        }
                    }
                }

                result = fanout_rx.recv() => {
                    match result {
                        Ok(envelope) => {
                            if !envelope.outbound.addressed_to(&self.id, self.bound.as_deref()) {
                                continue;
                            }
                            let json = match serde_json::to_string(&envelope.outbound.event) {
                                Ok(json) => json,
                                Err(e) => {
                                    tracing::warn!(error = %e, "failed to encode server event");
                                    continue;
                                }
                            };
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(
                                connection_id = %self.id,
                                skipped = n,
                                "connection lagged behind fan-out"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if !alive {
                        tracing::debug!(connection_id = %self.id, "heartbeat timeout, closing connection");
                        let _ = send_close(&mut ws_tx, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                        break;
                    }
                    alive = false;
                    if ws_tx.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "ignoring undecodable frame");
                return;
            }
        };

        let outbound = match event {
            ClientEvent::JoinSession(join) => {
                tracing::info!(
                    connection_id = %self.id,
                    session_id = %join.session_id,
                    user_id = %join.user_id,
                    "join-session"
                );
                self.bound = Some(join.session_id.clone());
                self.state.registry.join(&self.id, join)
            }
            ClientEvent::LeaveSession(leave) => {
                let outbound = self.state.registry.leave(&self.id, &leave.session_id);
                self.bound = self.state.registry.session_of(&self.id);
                outbound
            }
            ClientEvent::UpdateSession(snapshot) => {
                match self.state.registry.publish(&self.id, snapshot) {
                    Ok(outbound) => outbound,
                    Err(e) => {
                        tracing::warn!(connection_id = %self.id, error = %e, "ignoring update-session");
                        return;
                    }
                }
            }
        };
        self.dispatch(outbound).await;
    }

    async fn dispatch(&self, outbound: Vec<Outbound>) {
        for delivery in outbound {
            self.state.fanout.publish(delivery).await;
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
