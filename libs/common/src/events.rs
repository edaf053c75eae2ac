//! Wire events exchanged over the real-time channel.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.
//! Session snapshots travel as opaque JSON; the server never interprets them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSession {
    pub session_id: String,
}

/// Payload of `member-joined` / `member-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub user_name: String,
}

/// One row of a `member-roster` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSession(JoinSession),
    LeaveSession(LeaveSession),
    /// Full session document.
    UpdateSession(Value),
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full session document.
    SessionUpdate(Value),
    MemberJoined(Member),
    MemberLeft(Member),
    /// Full roster replace.
    MemberRoster(Vec<RosterEntry>),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinSession(_) => "join-session",
            ClientEvent::LeaveSession(_) => "leave-session",
            ClientEvent::UpdateSession(_) => "update-session",
        }
    }
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionUpdate(_) => "session-update",
            ServerEvent::MemberJoined(_) => "member-joined",
            ServerEvent::MemberLeft(_) => "member-left",
            ServerEvent::MemberRoster(_) => "member-roster",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_session_wire_shape() {
        let frame = json!({
            "event": "join-session",
            "data": { "sessionId": "S1", "userId": "u1", "userName": "Ada" }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinSession(JoinSession {
                session_id: "S1".into(),
                user_id: "u1".into(),
                user_name: "Ada".into(),
            })
        );
        assert_eq!(event.name(), "join-session");
    }

    #[test]
    fn roster_serializes_as_array_of_id_name() {
        let event = ServerEvent::MemberRoster(vec![
            RosterEntry { id: "u1".into(), name: "Ada".into() },
            RosterEntry { id: "u2".into(), name: "Grace".into() },
        ]);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "member-roster");
        assert_eq!(value["data"][1], json!({ "id": "u2", "name": "Grace" }));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let frame = json!({ "event": "drop-tables", "data": {} });
        assert!(serde_json::from_value::<ClientEvent>(frame).is_err());
    }
}
