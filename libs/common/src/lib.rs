pub mod document;
pub mod events;
pub mod id;
pub mod merge;
pub mod reconcile;
pub mod store;

pub use document::{SessionDocument, SnapshotError};
pub use events::{ClientEvent, ServerEvent};
pub use merge::{merge_incoming, merge_snapshots, EditTarget, LocalEdits};
pub use reconcile::{reconcile_actions, ReconcileReport};
pub use store::{ActionBacklog, MemoryTeamStore, StoreError, TeamRecord, TeamStore};
