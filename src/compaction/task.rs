use std::fmt;

use futures::TryStreamExt;
use itertools::Itertools;
use tokio::sync::watch;

use crate::{
    compaction::CompactionError,
    logging::tablet_event,
    mem::MemoryTracker,
    rowset::{RowsetId, RowsetMeta},
    store::{RowsetStore, RowsetWriterContext},
    tablet::TabletId,
    version::Version,
};

/// Flavour of a compaction task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompactionKind {
    /// Merge of a same-tier run outside the base region.
    Cumulative,
    /// Merge of the whole anchored prefix into one rowset.
    Base,
    /// Pull-down re-merge absorbing a pending delete into the larger data
    /// it still applies to.
    Backtrace,
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CompactionKind::Cumulative => "cumulative",
            CompactionKind::Base => "base",
            CompactionKind::Backtrace => "backtrace",
        };
        f.write_str(kind)
    }
}

/// An executable merge over a contiguous run of rowsets.
#[derive(Clone, Debug)]
pub struct CompactionTask {
    pub tablet_id: TabletId,
    pub kind: CompactionKind,
    /// Input metas in version order; contiguous by construction.
    pub inputs: Vec<RowsetMeta>,
    /// `[inputs.first.start, inputs.last.end]`.
    pub output_version: Version,
}

impl CompactionTask {
    pub(crate) fn over_run(tablet_id: TabletId, kind: CompactionKind, run: &[RowsetMeta]) -> Self {
        debug_assert!(!run.is_empty());
        debug_assert!(run
            .windows(2)
            .all(|pair| pair[1].version.follows(&pair[0].version)));
        Self {
            tablet_id,
            kind,
            inputs: run.to_vec(),
            output_version: Version::new(
                run[0].version.start,
                run[run.len() - 1].version.end,
            ),
        }
    }

    /// Input ids in version order.
    pub fn input_ids(&self) -> Vec<RowsetId> {
        self.inputs.iter().map(|rs| rs.id).collect()
    }

    /// Identity of the inputs used for apply-time re-validation.
    pub fn input_keys(&self) -> Vec<(RowsetId, Version)> {
        self.inputs.iter().map(|rs| (rs.id, rs.version)).collect()
    }

    /// Combined input data size; doubles as the merge buffer estimate.
    pub fn input_size(&self) -> u64 {
        self.inputs.iter().map(|rs| rs.data_disk_size).sum()
    }

    fn validate(&self) -> Result<(), CompactionError> {
        if self.inputs.is_empty() {
            return Err(CompactionError::Internal(
                "compaction task has no inputs".into(),
            ));
        }
        for pair in self.inputs.windows(2) {
            if !pair[1].version.follows(&pair[0].version) {
                return Err(CompactionError::Internal(format!(
                    "compaction inputs are not contiguous: {} then {}",
                    pair[0].version, pair[1].version
                )));
            }
        }
        let span = Version::new(
            self.inputs[0].version.start,
            self.inputs[self.inputs.len() - 1].version.end,
        );
        if span != self.output_version {
            return Err(CompactionError::Internal(format!(
                "output version {} does not cover inputs {}",
                self.output_version, span
            )));
        }
        Ok(())
    }

    /// Stream every input through the store in version order and build the
    /// replacement rowset. Cancellation is checked between chunks; a
    /// failure at any point leaves the catalog untouched.
    pub async fn execute(
        &self,
        store: &dyn RowsetStore,
        mem: &MemoryTracker,
        cancel: watch::Receiver<bool>,
        ctx: RowsetWriterContext,
    ) -> Result<CompactionOutcome, CompactionError> {
        self.validate()?;
        let estimate = self.input_size() as usize;
        let _reservation = mem.try_reserve(estimate).map_err(|available| {
            CompactionError::MemoryExhausted {
                requested: estimate,
                available,
            }
        })?;

        tablet_event!(
            log::Level::Info,
            self.tablet_id,
            "compaction_start",
            "kind={} output={} inputs={}",
            self.kind,
            self.output_version,
            self.inputs.iter().map(|rs| rs.version).join(","),
        );

        let mut writer = store.create_writer(ctx).await?;
        for input in &self.inputs {
            let mut chunks = store.open_reader(input).await?;
            while let Some(chunk) = chunks.try_next().await? {
                if *cancel.borrow() {
                    return Err(CompactionError::Canceled);
                }
                writer.add_chunk(chunk).await?;
            }
        }
        writer.flush().await?;
        let output = writer.build().await?;

        Ok(CompactionOutcome {
            kind: self.kind,
            inputs: self.input_keys(),
            output,
        })
    }
}

/// Result of a successful merge, ready to be applied to the catalog.
#[derive(Clone, Debug)]
pub struct CompactionOutcome {
    pub kind: CompactionKind,
    /// Identity of the consumed rowsets, re-validated at apply time.
    pub inputs: Vec<(RowsetId, Version)>,
    /// The replacement rowset.
    pub output: RowsetMeta,
}
