#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use retro_common::events::{JoinSession, RosterEntry};
use retro_common::{ClientEvent, ServerEvent};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use sync_api::config::Config;
use sync_api::gateway::fanout::MemoryFanout;
use sync_api::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

/// Build an AppState over the in-memory fan-out.
pub fn test_state_with(config: Config) -> AppState {
    let fanout = Arc::new(MemoryFanout::new(config.instance_id.clone()));
    AppState::new(config, fanout)
}

pub fn test_state() -> AppState {
    test_state_with(test_config())
}

/// Build the full application router wired to a fresh test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = sync_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Serve `state` on an already bound listener in the background.
pub fn serve(listener: tokio::net::TcpListener, state: AppState) {
    let app = sync_api::routes::router().with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Start an actual TCP server for WebSocket testing.
pub async fn start_ws_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    serve(listener, state);
    addr
}

pub async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect");
    ws
}

pub async fn send_raw(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("ws send");
}

pub async fn send_event(ws: &mut WsStream, event: &ClientEvent) {
    send_raw(ws, &serde_json::to_string(event).unwrap()).await;
}

pub fn join_event(session_id: &str, user_id: &str) -> ClientEvent {
    ClientEvent::JoinSession(JoinSession {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        user_name: user_id.to_uppercase(),
    })
}

/// Next server event, skipping control frames.
pub async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for server event")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("parse server event")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

pub async fn assert_no_event(ws: &mut WsStream) {
    let res = time::timeout(Duration::from_millis(150), ws.next()).await;
    assert!(res.is_err(), "expected silence, got {res:?}");
}

pub fn roster_ids(roster: &[RosterEntry]) -> Vec<&str> {
    roster.iter().map(|r| r.id.as_str()).collect()
}

/// Join and consume the joiner's own roster frame. Returns that roster.
pub async fn join(ws: &mut WsStream, session_id: &str, user_id: &str) -> Vec<RosterEntry> {
    send_event(ws, &join_event(session_id, user_id)).await;
    match next_event(ws).await {
        ServerEvent::MemberRoster(roster) => roster,
        other => panic!("expected member-roster, got {other:?}"),
    }
}
