//! Action reconciler.
//!
//! An action item lives both inside a session document and in the team's
//! backlog, and can be toggled or reassigned from either place. Before a local
//! mutation is broadcast, the backlog's `done` and `assignee` win over the
//! copy embedded in the session. Items the backlog has never seen are new
//! proposals from this session; they are left as-is and written to the backlog.

use crate::document::SessionDocument;
use crate::store::{ActionBacklog, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Embedded items overwritten from the backlog.
    pub updated: Vec<String>,
    /// Items written into the backlog for the first time.
    pub promoted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.promoted.is_empty()
    }
}

pub async fn reconcile_actions(
    doc: &mut SessionDocument,
    backlog: &dyn ActionBacklog,
) -> Result<ReconcileReport, StoreError> {
    let mut report = ReconcileReport::default();

    for item in doc.actions.iter_mut() {
        match backlog.find_action(&doc.team_id, &item.id).await? {
            Some(durable) => {
                if durable.done != item.done || durable.assignee != item.assignee {
                    item.done = durable.done;
                    item.assignee = durable.assignee;
                    report.updated.push(item.id.clone());
                }
            }
            None => {
                backlog.upsert_action(&doc.team_id, item.clone()).await?;
                report.promoted.push(item.id.clone());
            }
        }
    }

    if !report.is_noop() {
        tracing::debug!(
            session_id = %doc.id,
            updated = report.updated.len(),
            promoted = report.promoted.len(),
            "reconciled session actions with backlog"
        );
    }

    Ok(report)
}
