//! Local replica of one live session.
//!
//! Ties the lifecycle client, the merge engine, the action reconciler and the
//! canonical bridge together. Every state is an immutable `Arc` snapshot;
//! mutations clone the current one and install the result.

use std::sync::Arc;

use parking_lot::Mutex;
use retro_common::document::Participant;
use retro_common::{
    merge_incoming, reconcile_actions, ActionBacklog, EditTarget, LocalEdits, SessionDocument,
    TeamStore,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::CanonicalBridge;
use crate::client::SyncClient;
use crate::error::ClientError;
use crate::subscribers::Subscription;

struct Shared {
    client: Arc<SyncClient>,
    me: Participant,
    document: Mutex<Option<Arc<SessionDocument>>>,
    edits: Mutex<LocalEdits>,
    bridge: CanonicalBridge,
    backlog: Arc<dyn ActionBacklog>,
    updates: watch::Sender<Option<Arc<SessionDocument>>>,
    /// Serialises remote merges and local mutations.
    turn: tokio::sync::Mutex<()>,
}

pub struct SessionReplica {
    shared: Arc<Shared>,
    subscription: Option<Subscription>,
    worker: JoinHandle<()>,
}

impl SessionReplica {
    /// Subscribe to `session-update` on `client`. Snapshots are applied one at a
    /// time in arrival order.
    pub fn attach(
        client: Arc<SyncClient>,
        me: Participant,
        store: Arc<dyn TeamStore>,
        backlog: Arc<dyn ActionBacklog>,
    ) -> Self {
        let (updates, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            client,
            me,
            document: Mutex::new(None),
            edits: Mutex::new(LocalEdits::default()),
            bridge: CanonicalBridge::new(store),
            backlog,
            updates,
            turn: tokio::sync::Mutex::new(()),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let subscription = shared.client.on_snapshot(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });

        let worker = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Some(snapshot) = rx.recv().await {
                    shared.apply_remote(snapshot).await;
                }
            }
        });

        Self {
            shared,
            subscription: Some(subscription),
            worker,
        }
    }

    /// Install `doc` as the local state, join its room and make sure the local
    /// participant is on the board.
    pub async fn open(&self, doc: SessionDocument) -> Result<Arc<SessionDocument>, ClientError> {
        let me = self.shared.me.clone();
        let present = doc.participants.iter().any(|p| p.id == me.id);
        let session_id = doc.id.clone();
        let doc = Arc::new(doc);
        {
            let _turn = self.shared.turn.lock().await;
            self.shared.install(doc.clone());
        }

        self.shared
            .client
            .join_session(session_id, me.id.clone(), me.name.clone());

        if present {
            return Ok(doc);
        }
        self.mutate(move |d| {
            d.upsert_participant(me);
        })
        .await
    }

    /// Apply a local change: clone, edit, reconcile actions, bump the revision,
    /// install, persist, publish.
    pub async fn mutate<F>(&self, f: F) -> Result<Arc<SessionDocument>, ClientError>
    where
        F: FnOnce(&mut SessionDocument) + Send,
    {
        self.shared.mutate(f).await
    }

    pub fn set_editing(&self, target: EditTarget, active: bool) {
        self.shared.edits.lock().set(target, active);
    }

    pub fn edits(&self) -> LocalEdits {
        self.shared.edits.lock().clone()
    }

    pub fn document(&self) -> Option<Arc<SessionDocument>> {
        self.shared.document.lock().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Arc<SessionDocument>>> {
        self.shared.updates.subscribe()
    }

    /// Leave the room and drop the local state.
    pub async fn close(&self) {
        let _turn = self.shared.turn.lock().await;
        self.shared.client.leave_session();
        *self.shared.edits.lock() = LocalEdits::default();
        *self.shared.document.lock() = None;
        self.shared.updates.send_replace(None);
    }
}

impl Drop for SessionReplica {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.worker.abort();
    }
}

impl Shared {
    fn install(&self, doc: Arc<SessionDocument>) {
        *self.document.lock() = Some(doc.clone());
        self.updates.send_replace(Some(doc));
    }

    async fn apply_remote(&self, snapshot: Value) {
        let _turn = self.turn.lock().await;
        let Some(local) = self.document.lock().clone() else {
            tracing::debug!("no session open, ignoring snapshot");
            return;
        };
        let edits = self.edits.lock().clone();

        let merged = match merge_incoming(snapshot, Some(&local), &self.me.id, &edits) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(session_id = %local.id, error = %e, "discarding malformed snapshot");
                return;
            }
        };
        if merged.id != local.id {
            tracing::debug!(
                session_id = %local.id,
                other = %merged.id,
                "ignoring snapshot for another session"
            );
            return;
        }

        self.bridge.persist(&merged).await;
        self.install(Arc::new(merged));
    }

    /// Write `done`/`assignee` changes made by this mutation to the backlog, so
    /// the reconciler does not roll them back.
    async fn push_action_edits(&self, before: &SessionDocument, after: &SessionDocument) {
        for item in &after.actions {
            let Some(prev) = before.action(&item.id) else {
                continue;
            };
            if prev.done == item.done && prev.assignee == item.assignee {
                continue;
            }
            if let Err(e) = self.backlog.upsert_action(&after.team_id, item.clone()).await {
                tracing::warn!(
                    session_id = %after.id,
                    action_id = %item.id,
                    error = %e,
                    "failed to write action edit to backlog"
                );
            }
        }
    }

    async fn mutate<F>(&self, f: F) -> Result<Arc<SessionDocument>, ClientError>
    where
        F: FnOnce(&mut SessionDocument) + Send,
    {
        let _turn = self.turn.lock().await;
        let current = self.document.lock().clone().ok_or(ClientError::NoSession)?;

        let mut next = SessionDocument::clone(&current);
        f(&mut next);
        self.push_action_edits(&current, &next).await;
        if let Err(e) = reconcile_actions(&mut next, self.backlog.as_ref()).await {
            tracing::warn!(session_id = %next.id, error = %e, "action reconciliation failed");
        }
        next.revision = current.revision + 1;

        let snapshot = next.to_snapshot()?;
        let next = Arc::new(next);
        self.install(next.clone());
        self.bridge.persist(&next).await;
        self.client.publish(snapshot);
        Ok(next)
    }
}
