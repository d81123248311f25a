//! vault-merge - Reconciliation of divergent vault replicas
//!
//! Two copies of the same database that were edited independently are
//! combined into one without user interaction: every object resolves by
//! last-write-wins on its modification time, deletions are arbitrated
//! against edits through tombstones, and entry histories are unioned so
//! no prior value is lost. The result is deterministic and merging is
//! idempotent: replaying the same remote changes a second time is a no-op.

mod merge;
mod types;

pub use merge::merge;
pub use types::{MergeError, MergeStats, Side};
