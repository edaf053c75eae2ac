//! The session document: the full mutable state of one retrospective or
//! health-check run, and the single unit of synchronization.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an incoming snapshot could not be turned into a [`SessionDocument`].
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not a valid session document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("snapshot field `{0}` must not be empty")]
    EmptyField(&'static str),
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    #[default]
    Retrospective,
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Closed,
}

/// Workflow stages, in the order a facilitator walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Lobby,
    Icebreaker,
    Brainstorm,
    Group,
    Vote,
    Discuss,
    Review,
    Close,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Lobby,
        Phase::Icebreaker,
        Phase::Brainstorm,
        Phase::Group,
        Phase::Vote,
        Phase::Discuss,
        Phase::Review,
        Phase::Close,
    ];

    /// The stage after this one. `Close` is terminal.
    pub fn next(self) -> Phase {
        let idx = Self::ALL.iter().position(|p| *p == self).unwrap_or(0);
        Self::ALL.get(idx + 1).copied().unwrap_or(Phase::Close)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Facilitator,
    #[default]
    Participant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CarriedOver,
    Accepted,
    #[default]
    Proposal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalVote {
    Up,
    Down,
    Neutral,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: String::new(),
            role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub column_id: String,
    pub text: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    /// One entry per vote; a user may appear several times up to the cap.
    #[serde(default)]
    pub votes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub column_id: String,
    pub title: String,
    #[serde(default)]
    pub votes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub kind: ActionKind,
    /// Only meaningful while `kind == Proposal`.
    #[serde(default)]
    pub proposal_votes: BTreeMap<String, ProposalVote>,
}

impl ActionItem {
    pub fn proposal(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            assignee: None,
            done: false,
            kind: ActionKind::Proposal,
            proposal_votes: BTreeMap::new(),
        }
    }

    /// Promote a proposal to an accepted action. Proposal votes are dropped.
    pub fn accept(&mut self) {
        self.kind = ActionKind::Accepted;
        self.proposal_votes.clear();
    }

    /// `(up, down)` counts of the proposal votes.
    pub fn tally(&self) -> (usize, usize) {
        self.proposal_votes
            .values()
            .fold((0, 0), |(up, down), vote| match vote {
                ProposalVote::Up => (up + 1, down),
                ProposalVote::Down => (up, down + 1),
                ProposalVote::Neutral => (up, down),
            })
    }
}

/// Countdown stored as an absolute start plus a nominal duration, so the
/// remaining time is derived on every read and never drifts between clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: u32,
}

impl Timer {
    pub fn start(now: DateTime<Utc>, duration_secs: u32) -> Self {
        Self {
            started_at: Some(now),
            duration_secs,
        }
    }

    pub fn stop(&mut self) {
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let ends_at = started_at + chrono::Duration::seconds(i64::from(self.duration_secs));
        (ends_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_running() && self.remaining(now).is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Votes each participant may cast across tickets and groups.
    pub max_votes: u32,
    pub anonymous: bool,
    pub reveal_tickets: bool,
    pub reveal_votes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_votes: 3,
            anonymous: false,
            reveal_tickets: false,
            reveal_votes: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub id: String,
    pub team_id: String,
    #[serde(default)]
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub phase: Phase,
    /// Bumped on every local mutation.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub actions: Vec<ActionItem>,
    /// Single-choice mood pick per user id.
    #[serde(default)]
    pub mood: BTreeMap<String, String>,
    /// Health-check ratings: dimension id -> user id -> score.
    #[serde(default)]
    pub ratings: BTreeMap<String, BTreeMap<String, u8>>,
    /// Answers to the open-ended prompt, per user id.
    #[serde(default)]
    pub open_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub timer: Timer,
    #[serde(default)]
    pub settings: Settings,
    /// Fields this build does not know about, kept so they survive a round trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionDocument {
    pub fn new(id: impl Into<String>, team_id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            id: id.into(),
            team_id: team_id.into(),
            kind,
            status: SessionStatus::InProgress,
            phase: Phase::Lobby,
            revision: 0,
            participants: Vec::new(),
            tickets: Vec::new(),
            groups: Vec::new(),
            actions: Vec::new(),
            mood: BTreeMap::new(),
            ratings: BTreeMap::new(),
            open_answers: BTreeMap::new(),
            timer: Timer::default(),
            settings: Settings::default(),
            extra: Map::new(),
        }
    }

    /// Parse and structurally validate a snapshot received over the wire.
    pub fn from_snapshot(value: Value) -> Result<Self, SnapshotError> {
        let doc: SessionDocument = serde_json::from_value(value)?;
        if doc.id.trim().is_empty() {
            return Err(SnapshotError::EmptyField("id"));
        }
        if doc.team_id.trim().is_empty() {
            return Err(SnapshotError::EmptyField("teamId"));
        }
        Ok(doc)
    }

    pub fn to_snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Insert or update a participant, keeping the roster unique by id and by
    /// case-insensitive display name. Returns whether the roster changed.
    pub fn upsert_participant(&mut self, participant: Participant) -> bool {
        if let Some(existing) = self.participants.iter_mut().find(|p| p.id == participant.id) {
            if *existing == participant {
                return false;
            }
            *existing = participant;
            return true;
        }

        let name = participant.name.trim().to_lowercase();
        if !name.is_empty() {
            if let Some(existing) = self
                .participants
                .iter_mut()
                .find(|p| p.name.trim().to_lowercase() == name)
            {
                // Same person reconnecting with a fresh id.
                *existing = participant;
                return true;
            }
        }

        self.participants.push(participant);
        true
    }

    pub fn ticket(&self, id: &str) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    pub fn ticket_mut(&mut self, id: &str) -> Option<&mut Ticket> {
        self.tickets.iter_mut().find(|t| t.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn action(&self, id: &str) -> Option<&ActionItem> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn action_mut(&mut self, id: &str) -> Option<&mut ActionItem> {
        self.actions.iter_mut().find(|a| a.id == id)
    }

    /// Ticket and group votes cast by `user_id`, counted against `settings.max_votes`.
    pub fn votes_cast_by(&self, user_id: &str) -> usize {
        let on_tickets = self.tickets.iter().flat_map(|t| &t.votes);
        let on_groups = self.groups.iter().flat_map(|g| &g.votes);
        on_tickets.chain(on_groups).filter(|v| *v == user_id).count()
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Retire the session. It stays writable; late reconnections still work.
    pub fn close(&mut self) {
        self.status = SessionStatus::Closed;
        self.phase = Phase::Close;
        self.timer.stop();
    }
}
