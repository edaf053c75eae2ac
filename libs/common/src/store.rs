//! Durable per-team record store and action backlog.
//!
//! These are collaborators owned outside the sync engine. The traits describe
//! what the engine needs from them; [`MemoryTeamStore`] backs tests and
//! single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{ActionItem, SessionDocument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("team `{0}` not found")]
    TeamNotFound(String),
    #[error("team `{team_id}` was modified concurrently (expected revision {expected}, found {found})")]
    Conflict {
        team_id: String,
        expected: u64,
        found: u64,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Everything persisted for one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    pub id: String,
    pub name: String,
    /// Optimistic concurrency token, bumped on every successful save.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub sessions: Vec<SessionDocument>,
    /// The session-independent action backlog.
    #[serde(default)]
    pub actions: Vec<ActionItem>,
    pub updated_at: DateTime<Utc>,
}

impl TeamRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            revision: 0,
            sessions: Vec::new(),
            actions: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionDocument> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    fn put_session(&mut self, doc: &SessionDocument) {
        match self.sessions.iter_mut().find(|s| s.id == doc.id) {
            Some(existing) => *existing = doc.clone(),
            None => self.sessions.push(doc.clone()),
        }
    }

    fn put_action(&mut self, item: ActionItem) {
        match self.actions.iter_mut().find(|a| a.id == item.id) {
            Some(existing) => *existing = item,
            None => self.actions.push(item),
        }
    }
}

#[async_trait]
pub trait TeamStore: Send + Sync {
    async fn load_team(&self, team_id: &str) -> Result<Option<TeamRecord>, StoreError>;

    /// Whole-record replace. `record.revision` must match the stored revision;
    /// the saved record carries the next revision.
    async fn save_team(&self, record: TeamRecord) -> Result<TeamRecord, StoreError>;

    /// Replace (or insert) one session sub-document by id.
    async fn save_session(&self, team_id: &str, doc: &SessionDocument) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ActionBacklog: Send + Sync {
    async fn find_action(
        &self,
        team_id: &str,
        action_id: &str,
    ) -> Result<Option<ActionItem>, StoreError>;

    async fn upsert_action(&self, team_id: &str, item: ActionItem) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTeamStore {
    teams: Mutex<HashMap<String, TeamRecord>>,
}

impl MemoryTeamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a team record, bypassing the revision check.
    pub fn insert(&self, record: TeamRecord) {
        self.teams.lock().insert(record.id.clone(), record);
    }

    fn with_team<T>(
        &self,
        team_id: &str,
        f: impl FnOnce(&mut TeamRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut teams = self.teams.lock();
        let record = teams
            .get_mut(team_id)
            .ok_or_else(|| StoreError::TeamNotFound(team_id.to_string()))?;
        Ok(f(record))
    }
}

#[async_trait]
impl TeamStore for MemoryTeamStore {
    async fn load_team(&self, team_id: &str) -> Result<Option<TeamRecord>, StoreError> {
        Ok(self.teams.lock().get(team_id).cloned())
    }

    async fn save_team(&self, mut record: TeamRecord) -> Result<TeamRecord, StoreError> {
        let mut teams = self.teams.lock();
        if let Some(stored) = teams.get(&record.id) {
            if stored.revision != record.revision {
                return Err(StoreError::Conflict {
                    team_id: record.id,
                    expected: record.revision,
                    found: stored.revision,
                });
            }
        }
        record.revision += 1;
        record.updated_at = Utc::now();
        teams.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn save_session(&self, team_id: &str, doc: &SessionDocument) -> Result<(), StoreError> {
        self.with_team(team_id, |record| {
            record.put_session(doc);
            record.updated_at = Utc::now();
        })
    }
}

#[async_trait]
impl ActionBacklog for MemoryTeamStore {
    async fn find_action(
        &self,
        team_id: &str,
        action_id: &str,
    ) -> Result<Option<ActionItem>, StoreError> {
        self.with_team(team_id, |record| {
            record.actions.iter().find(|a| a.id == action_id).cloned()
        })
    }

    async fn upsert_action(&self, team_id: &str, item: ActionItem) -> Result<(), StoreError> {
        self.with_team(team_id, |record| {
            record.put_action(item);
            record.updated_at = Utc::now();
        })
    }
}
