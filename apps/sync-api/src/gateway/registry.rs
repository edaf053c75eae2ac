//! Room registry: which connection is bound to which session, plus the last
//! snapshot published in each session.
//!
//! Every operation takes the single state lock, never awaits while holding it,
//! and returns the deliveries the caller must hand to the fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use retro_common::events::{JoinSession, Member, RosterEntry};
use retro_common::ServerEvent;
use serde_json::Value;
use thiserror::Error;

use super::events::Outbound;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection `{0}` is not bound to a session")]
    NotInSession(String),
}

struct Binding {
    session_id: String,
    user_id: String,
    user_name: String,
}

impl Binding {
    fn member(&self) -> Member {
        Member {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
        }
    }
}

struct Room {
    /// Connection ids in join order.
    members: Vec<String>,
    snapshot: Option<Arc<Value>>,
    touched: Instant,
}

impl Room {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            snapshot: None,
            touched: Instant::now(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Binding>,
    rooms: HashMap<String, Room>,
}

impl RegistryState {
    fn roster(&self, session_id: &str) -> Vec<RosterEntry> {
        let Some(room) = self.rooms.get(session_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|conn| self.connections.get(conn))
            .map(|b| RosterEntry {
                id: b.user_id.clone(),
                name: b.user_name.clone(),
            })
            .collect()
    }

    fn unbind(&mut self, connection_id: &str) -> Vec<Outbound> {
        let Some(binding) = self.connections.remove(connection_id) else {
            return Vec::new();
        };
        if let Some(room) = self.rooms.get_mut(&binding.session_id) {
            room.members.retain(|c| c != connection_id);
            room.touched = Instant::now();
        }

        tracing::debug!(
            connection_id,
            session_id = %binding.session_id,
            user_id = %binding.user_id,
            "connection left session"
        );
        vec![
            Outbound::to_room_except(
                binding.session_id.clone(),
                connection_id,
                ServerEvent::MemberLeft(binding.member()),
            ),
            Outbound::to_room(
                binding.session_id.clone(),
                ServerEvent::MemberRoster(self.roster(&binding.session_id)),
            ),
        ]
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection_id` to `join.session_id`, moving it out of any other
    /// session first. The joiner receives the cached snapshot, if any.
    pub fn join(&self, connection_id: &str, join: JoinSession) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut state = self.state.lock();

        let moving = state
            .connections
            .get(connection_id)
            .is_some_and(|b| b.session_id != join.session_id);
        if moving {
            out.extend(state.unbind(connection_id));
        }

        let binding = Binding {
            session_id: join.session_id.clone(),
            user_id: join.user_id,
            user_name: join.user_name,
        };
        let member = binding.member();
        state.connections.insert(connection_id.to_string(), binding);

        let room = state
            .rooms
            .entry(join.session_id.clone())
            .or_insert_with(Room::new);
        if !room.members.iter().any(|c| c == connection_id) {
            room.members.push(connection_id.to_string());
        }
        room.touched = Instant::now();
        let snapshot = room.snapshot.clone();
        let roster = state.roster(&join.session_id);
        drop(state);

        tracing::debug!(
            connection_id,
            session_id = %join.session_id,
            user_id = %member.user_id,
            members = roster.len(),
            "connection joined session"
        );

        out.push(Outbound::to_room_except(
            join.session_id.clone(),
            connection_id,
            ServerEvent::MemberJoined(member),
        ));
        out.push(Outbound::to_room(
            join.session_id.clone(),
            ServerEvent::MemberRoster(roster),
        ));
        if let Some(snapshot) = snapshot {
            out.push(Outbound::to_connection(
                join.session_id,
                connection_id,
                ServerEvent::SessionUpdate(Value::clone(&snapshot)),
            ));
        }
        out
    }

    /// Unbind `connection_id` from `session_id`. A leave naming any other
    /// session is ignored.
    pub fn leave(&self, connection_id: &str, session_id: &str) -> Vec<Outbound> {
        let mut state = self.state.lock();
        let bound = state
            .connections
            .get(connection_id)
            .is_some_and(|b| b.session_id == session_id);
        if !bound {
            tracing::debug!(connection_id, session_id, "ignoring leave for unbound session");
            return Vec::new();
        }
        state.unbind(connection_id)
    }

    /// Replace the session's cached snapshot and send it to the rest of the room.
    pub fn publish(
        &self,
        connection_id: &str,
        snapshot: Value,
    ) -> Result<Vec<Outbound>, RegistryError> {
        let mut state = self.state.lock();
        let session_id = state
            .connections
            .get(connection_id)
            .map(|b| b.session_id.clone())
            .ok_or_else(|| RegistryError::NotInSession(connection_id.to_string()))?;

        let room = state.rooms.entry(session_id.clone()).or_insert_with(Room::new);
        room.snapshot = Some(Arc::new(snapshot.clone()));
        room.touched = Instant::now();
        drop(state);

        Ok(vec![Outbound::to_room_except(
            session_id,
            connection_id,
            ServerEvent::SessionUpdate(snapshot),
        )])
    }

    /// Transport closed.
    pub fn disconnect(&self, connection_id: &str) -> Vec<Outbound> {
        self.state.lock().unbind(connection_id)
    }

    pub fn session_of(&self, connection_id: &str) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(connection_id)
            .map(|b| b.session_id.clone())
    }

    pub fn roster(&self, session_id: &str) -> Vec<RosterEntry> {
        self.state.lock().roster(session_id)
    }

    pub fn cached_snapshot(&self, session_id: &str) -> Option<Arc<Value>> {
        self.state
            .lock()
            .rooms
            .get(session_id)
            .and_then(|r| r.snapshot.clone())
    }

    /// Cache-only write, for snapshots published through another instance.
    pub fn store_snapshot(&self, session_id: &str, snapshot: Value) {
        let mut state = self.state.lock();
        let room = state
            .rooms
            .entry(session_id.to_string())
            .or_insert_with(Room::new);
        room.snapshot = Some(Arc::new(snapshot));
        room.touched = Instant::now();
    }

    /// Drop rooms with no members that were last touched more than `ttl` ago.
    /// Returns how many cached snapshots were discarded.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.state.lock().rooms.retain(|_, room| {
            let keep = !room.members.is_empty() || now.duration_since(room.touched) < ttl;
            if !keep && room.snapshot.is_some() {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

/// Run [`RoomRegistry::evict_idle`] every `interval`.
pub fn spawn_sweeper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.evict_idle(ttl);
            if evicted > 0 {
                tracing::info!(evicted, "evicted idle session snapshots");
            }
        }
    })
}
