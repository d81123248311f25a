//! Types for merge operations

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which replica a resolved object came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// The current/local replica
    Local,
    /// The incoming/remote replica
    Remote,
}

/// Counters describing what a merge did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Entries that existed on one side only and were carried over
    pub entries_added: usize,
    /// Entries present on both sides where the newer version won
    pub entries_resolved: usize,
    /// Entries removed because a deletion won over the surviving side
    pub entries_deleted: usize,
    /// Groups that existed on one side only and were carried over
    pub groups_added: usize,
    /// Groups removed because a deletion won
    pub groups_deleted: usize,
    /// Deletions discarded because an edit was newer than the tombstone
    pub tombstones_discarded: usize,
}

impl MergeStats {
    /// True when the merge changed nothing relative to the local replica
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Errors a merge can report
#[derive(Error, Debug)]
pub enum MergeError {
    /// The two databases are not replicas of each other
    #[error("databases do not share an identity: {local} vs {remote}")]
    DatabaseMismatch { local: Uuid, remote: Uuid },

    /// A conflict the resolution policy could not settle automatically.
    /// The timestamp-then-digest ordering is total, so this is never
    /// produced by the current policy.
    #[error("merge conflict could not be resolved automatically: {0}")]
    ConflictUnresolved(Uuid),

    /// The merged object graph failed to reassemble
    #[error(transparent)]
    Core(#[from] vault_core::Error),
}
