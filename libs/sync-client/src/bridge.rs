use std::sync::Arc;

use retro_common::{SessionDocument, TeamStore};

/// Writes every accepted session state through to the durable team record.
#[derive(Clone)]
pub struct CanonicalBridge {
    store: Arc<dyn TeamStore>,
}

impl CanonicalBridge {
    pub fn new(store: Arc<dyn TeamStore>) -> Self {
        Self { store }
    }

    /// Save `doc` as its team's session sub-document. Failures are logged and
    /// reported as `false`; they never reach the merge path.
    pub async fn persist(&self, doc: &SessionDocument) -> bool {
        match self.store.save_session(&doc.team_id, doc).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    session_id = %doc.id,
                    team_id = %doc.team_id,
                    error = %e,
                    "failed to persist session"
                );
                false
            }
        }
    }
}
