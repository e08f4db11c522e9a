//! Compaction policy, task execution and background scheduling.
//!
//! The selector is pure: it reads a catalog snapshot, a delete index and a
//! clock value, and returns at most one task. Everything that blocks
//! (merge I/O, the scheduler loop, the cleaner) lives behind it.

mod error;
mod scheduler;
mod size_tiered;
mod task;
mod tier;

use std::fmt;

pub use error::CompactionError;
pub use scheduler::{CleanTag, Cleaner, CompactionScheduler};
pub use task::{CompactionKind, CompactionOutcome, CompactionTask};
pub use tier::TierLadder;

use crate::{
    catalog::{Catalog, DeleteIndex},
    option::CompactionStrategy,
    tablet::TabletId,
};

/// Result of one selector pass.
#[derive(Debug)]
pub enum Selection {
    /// A task to hand to the executor.
    Compact(CompactionTask),
    /// Normal negative result, with the reason.
    Skip(SkipReason),
}

impl Selection {
    /// Whether a task was selected.
    pub fn is_compact(&self) -> bool {
        matches!(self, Selection::Compact(_))
    }

    /// The task, if one was selected.
    pub fn into_task(self) -> Option<CompactionTask> {
        match self {
            Selection::Compact(task) => Some(task),
            Selection::Skip(_) => None,
        }
    }
}

/// Why the selector declined to propose a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    EmptyCatalog,
    SingleRowset,
    OnlyTombstones,
    NoQualifiedRun,
    Disabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::EmptyCatalog => "catalog is empty",
            SkipReason::SingleRowset => "a single rowset is never compacted",
            SkipReason::OnlyTombstones => "catalog holds only tombstone rowsets",
            SkipReason::NoQualifiedRun => "no run qualified",
            SkipReason::Disabled => "compaction is disabled",
        };
        f.write_str(reason)
    }
}

impl CompactionStrategy {
    /// Run the configured policy over a catalog snapshot.
    pub fn select(
        &self,
        tablet_id: TabletId,
        catalog: &Catalog,
        deletes: &DeleteIndex,
        now: i64,
    ) -> Selection {
        match self {
            CompactionStrategy::SizeTiered(options) => {
                size_tiered::select(options, tablet_id, catalog, deletes, now)
            }
            CompactionStrategy::Disabled => Selection::Skip(SkipReason::Disabled),
        }
    }
}
