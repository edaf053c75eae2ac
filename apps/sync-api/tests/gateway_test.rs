mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use retro_common::events::{LeaveSession, Member};
use retro_common::{ClientEvent, ServerEvent};
use serde_json::json;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use common::{assert_no_event, connect, join, next_event, roster_ids, send_event, send_raw};

fn member(user_id: &str) -> Member {
    Member {
        user_id: user_id.to_string(),
        user_name: user_id.to_uppercase(),
    }
}

#[tokio::test]
async fn join_broadcasts_full_roster_to_room() {
    let addr = common::start_ws_server(common::test_state()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    let roster = join(&mut a, "S1", "u1").await;
    assert_eq!(roster_ids(&roster), ["u1"]);

    let roster = join(&mut b, "S1", "u2").await;
    assert_eq!(roster_ids(&roster), ["u1", "u2"]);

    assert_eq!(next_event(&mut a).await, ServerEvent::MemberJoined(member("u2")));
    match next_event(&mut a).await {
        ServerEvent::MemberRoster(roster) => assert_eq!(roster_ids(&roster), ["u1", "u2"]),
        other => panic!("expected roster, got {other:?}"),
    }
    assert_no_event(&mut a).await;
    assert_no_event(&mut b).await;
}

#[tokio::test]
async fn update_reaches_room_but_not_sender() {
    let addr = common::start_ws_server(common::test_state()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut other_room = connect(addr).await;

    join(&mut a, "S1", "u1").await;
    join(&mut b, "S1", "u2").await;
    join(&mut other_room, "S2", "u3").await;
    next_event(&mut a).await; // member-joined
    next_event(&mut a).await; // roster

    let snapshot = json!({"id": "S1", "phase": "VOTE"});
    send_event(&mut a, &ClientEvent::UpdateSession(snapshot.clone())).await;

    assert_eq!(next_event(&mut b).await, ServerEvent::SessionUpdate(snapshot));
    assert_no_event(&mut a).await;
    assert_no_event(&mut other_room).await;
}

#[tokio::test]
async fn late_joiner_receives_cached_snapshot() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let mut a = connect(addr).await;
    join(&mut a, "S1", "u1").await;

    let snapshot = json!({"id": "S1", "phase": "DISCUSS"});
    send_event(&mut a, &ClientEvent::UpdateSession(snapshot.clone())).await;
    time::timeout(Duration::from_secs(2), async {
        while state.registry.cached_snapshot("S1").is_none() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot never cached");

    let mut late = connect(addr).await;
    let roster = join(&mut late, "S1", "u2").await;
    assert_eq!(roster_ids(&roster), ["u1", "u2"]);
    assert_eq!(next_event(&mut late).await, ServerEvent::SessionUpdate(snapshot.clone()));
    assert_eq!(state.registry.cached_snapshot("S1").as_deref(), Some(&snapshot));
}

#[tokio::test]
async fn leave_sends_exactly_one_member_left() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "S1", "u1").await;
    join(&mut b, "S1", "u2").await;
    next_event(&mut a).await;
    next_event(&mut a).await;

    let leave = ClientEvent::LeaveSession(LeaveSession {
        session_id: "S1".into(),
    });
    send_event(&mut b, &leave).await;
    send_event(&mut b, &leave).await;

    assert_eq!(next_event(&mut a).await, ServerEvent::MemberLeft(member("u2")));
    match next_event(&mut a).await {
        ServerEvent::MemberRoster(roster) => assert_eq!(roster_ids(&roster), ["u1"]),
        other => panic!("expected roster, got {other:?}"),
    }
    assert_no_event(&mut a).await;
    assert_no_event(&mut b).await;
    assert_eq!(state.registry.roster("S1").len(), 1);
}

#[tokio::test]
async fn transport_close_counts_as_leave() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "S1", "u1").await;
    join(&mut b, "S1", "u2").await;
    next_event(&mut a).await;
    next_event(&mut a).await;

    b.close(None).await.expect("close");
    drop(b);

    assert_eq!(next_event(&mut a).await, ServerEvent::MemberLeft(member("u2")));
    match next_event(&mut a).await {
        ServerEvent::MemberRoster(roster) => assert_eq!(roster_ids(&roster), ["u1"]),
        other => panic!("expected roster, got {other:?}"),
    }
}

#[tokio::test]
async fn joining_another_session_leaves_the_first() {
    let addr = common::start_ws_server(common::test_state()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "S1", "u1").await;
    join(&mut b, "S1", "u2").await;
    next_event(&mut a).await;
    next_event(&mut a).await;

    let roster = join(&mut a, "S2", "u1").await;
    assert_eq!(roster_ids(&roster), ["u1"]);

    assert_eq!(next_event(&mut b).await, ServerEvent::MemberLeft(member("u1")));
    match next_event(&mut b).await {
        ServerEvent::MemberRoster(roster) => assert_eq!(roster_ids(&roster), ["u2"]),
        other => panic!("expected roster, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_frames_are_ignored() {
    let addr = common::start_ws_server(common::test_state()).await;
    let mut a = connect(addr).await;

    send_raw(&mut a, "not json").await;
    send_raw(&mut a, r#"{"event":"launch-rockets","data":{}}"#).await;
    send_raw(&mut a, r#"{"event":"join-session","data":{"sessionId":"S1"}}"#).await;
    assert_no_event(&mut a).await;

    let roster = join(&mut a, "S1", "u1").await;
    assert_eq!(roster_ids(&roster), ["u1"]);
}

#[tokio::test]
async fn update_from_unbound_connection_is_dropped() {
    let state = common::test_state();
    let addr = common::start_ws_server(state.clone()).await;
    let mut watcher = connect(addr).await;
    join(&mut watcher, "S1", "u1").await;

    let mut stray = connect(addr).await;
    send_event(&mut stray, &ClientEvent::UpdateSession(json!({"id": "S1"}))).await;

    assert_no_event(&mut watcher).await;
    assert!(state.registry.cached_snapshot("S1").is_none());

    let roster = join(&mut stray, "S1", "u2").await;
    assert_eq!(roster_ids(&roster), ["u1", "u2"]);
}

#[tokio::test]
async fn silent_connection_is_closed_after_heartbeat() {
    let config = sync_api::config::Config {
        heartbeat_interval: Duration::from_millis(100),
        ..common::test_config()
    };
    let state = common::test_state_with(config);
    let addr = common::start_ws_server(state.clone()).await;
    let mut ws = connect(addr).await;
    join(&mut ws, "S1", "u1").await;

    // Not reading means no pong goes back.
    time::sleep(Duration::from_millis(400)).await;

    let mut close_code = None;
    loop {
        let next = time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
    assert_eq!(close_code, Some(4009));

    time::timeout(Duration::from_secs(2), async {
        while state.registry.connection_count() > 0 {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection not unbound after heartbeat close");
}

#[tokio::test]
async fn answering_pings_keeps_connection_open() {
    let config = sync_api::config::Config {
        heartbeat_interval: Duration::from_millis(100),
        ..common::test_config()
    };
    let addr = common::start_ws_server(common::test_state_with(config)).await;
    let mut ws = connect(addr).await;
    join(&mut ws, "S1", "u1").await;

    // Keep reading so pongs flow back; the server must never close.
    let deadline = time::Instant::now() + Duration::from_millis(500);
    while time::Instant::now() < deadline {
        match time::timeout(Duration::from_millis(50), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => panic!("server closed a live connection"),
            Ok(Some(Err(e))) => panic!("ws error: {e}"),
            _ => {}
        }
    }
    ws.send(Message::Text(
        serde_json::to_string(&common::join_event("S1", "u1")).unwrap().into(),
    ))
    .await
    .expect("connection still writable");
}
