//! The tablet façade: catalog ownership, the compaction entry points and
//! apply-time re-validation.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use itertools::Itertools;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    catalog::{Catalog, CatalogError, DeleteIndex},
    compaction::{CompactionError, CompactionKind, CompactionOutcome, CompactionTask, Selection},
    logging::tablet_event,
    mem::MemoryTracker,
    option::{CompactionStrategy, StoreOptions},
    rowset::{RowsetId, RowsetIdAllocator, RowsetMeta},
    store::{RowsetStore, RowsetWriterContext},
    version::Version,
};

/// Identifier of a tablet within a storage root.
pub type TabletId = u64;

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Failures on the tablet's ingest and catalog surface.
#[derive(Debug, Error)]
pub enum TabletError {
    #[error("tablet {tablet_id}: {source}")]
    Catalog {
        tablet_id: TabletId,
        #[source]
        source: CatalogError,
    },
    #[error(transparent)]
    Compaction(#[from] CompactionError),
}

struct TabletMeta {
    catalog: Catalog,
    deletes: DeleteIndex,
}

/// Summary of one applied compaction, handed to the cleaner.
#[derive(Clone, Debug)]
pub struct AppliedCompaction {
    pub kind: CompactionKind,
    pub output_version: Version,
    /// Rowsets swapped out of the catalog, now unreferenced.
    pub removed: Vec<RowsetId>,
}

/// A horizontal shard of a table: a catalog of rowsets sharing a schema,
/// plus the compaction strategy that maintains it.
///
/// The catalog is guarded by the meta lock. Selection runs on a snapshot
/// taken under the lock; the lock is released for the duration of a merge
/// and re-acquired by [`Tablet::apply`], which re-validates every input
/// before the swap.
pub struct Tablet {
    id: TabletId,
    partition_id: u64,
    strategy: CompactionStrategy,
    meta: RwLock<TabletMeta>,
    store: Arc<dyn RowsetStore>,
    mem: Arc<MemoryTracker>,
    ids: RowsetIdAllocator,
    shutdown: watch::Sender<bool>,
    poisoned: AtomicBool,
}

impl Tablet {
    /// Reconstruct a tablet from persisted rowset metas. The policy keeps
    /// no state of its own across restarts.
    pub fn open(
        id: TabletId,
        partition_id: u64,
        rowsets: Vec<RowsetMeta>,
        options: &StoreOptions,
        store: Arc<dyn RowsetStore>,
        mem: Arc<MemoryTracker>,
    ) -> Result<Arc<Self>, TabletError> {
        let mut catalog = Catalog::new();
        let mut deletes = DeleteIndex::new();
        for meta in rowsets {
            if let Some(predicate) = &meta.delete_predicate {
                deletes.record(predicate.clone());
            }
            catalog
                .insert(meta)
                .map_err(|source| TabletError::Catalog {
                    tablet_id: id,
                    source,
                })?;
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            partition_id,
            strategy: options.strategy().clone(),
            meta: RwLock::new(TabletMeta { catalog, deletes }),
            store,
            mem,
            ids: RowsetIdAllocator::new(id),
            shutdown,
            poisoned: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> TabletId {
        self.id
    }

    pub fn partition_id(&self) -> u64 {
        self.partition_id
    }

    /// Ingest path: add a freshly built rowset to the catalog.
    pub fn add_rowset(&self, meta: RowsetMeta) -> Result<(), TabletError> {
        let predicate = meta.delete_predicate.clone();
        let mut guard = self.meta.write();
        guard
            .catalog
            .insert(meta)
            .map_err(|source| TabletError::Catalog {
                tablet_id: self.id,
                source,
            })?;
        if let Some(predicate) = predicate {
            guard.deletes.record(predicate);
        }
        Ok(())
    }

    /// Version intervals currently in the catalog, in order.
    pub fn list_versions(&self) -> Vec<Version> {
        self.meta.read().catalog.versions()
    }

    pub fn version_count(&self) -> usize {
        self.meta.read().catalog.len()
    }

    /// Snapshot of the rowset metas, in version order.
    pub fn rowset_metas(&self) -> Vec<RowsetMeta> {
        self.meta.read().catalog.iter().cloned().collect()
    }

    /// Delete versions still pending application to older rows.
    pub fn tracked_deletes(&self) -> Vec<u64> {
        self.meta
            .read()
            .deletes
            .effective_deletes(&Version::new(0, u64::MAX))
    }

    fn snapshot(&self) -> (Catalog, DeleteIndex) {
        let guard = self.meta.read();
        (guard.catalog.clone(), guard.deletes.clone())
    }

    /// Whether the selector would currently propose a task.
    pub fn need_compaction(&self) -> bool {
        if self.is_poisoned() || *self.shutdown.borrow() {
            return false;
        }
        let (catalog, deletes) = self.snapshot();
        self.strategy
            .select(self.id, &catalog, &deletes, unix_now())
            .is_compact()
    }

    /// Snapshot the catalog and run the selector. May return `None` even
    /// when [`Tablet::need_compaction`] held, if racing ingest changed the
    /// catalog in between.
    pub fn create_compaction_task(&self) -> Option<CompactionTask> {
        if self.is_poisoned() || *self.shutdown.borrow() {
            return None;
        }
        let (catalog, deletes) = self.snapshot();
        match self.strategy.select(self.id, &catalog, &deletes, unix_now()) {
            Selection::Compact(task) => Some(task),
            Selection::Skip(reason) => {
                tablet_event!(
                    log::Level::Debug,
                    self.id,
                    "no_need_compact",
                    "reason={}",
                    reason,
                );
                None
            }
        }
    }

    /// Re-validate the inputs under the meta lock and atomically swap them
    /// for the output. A mismatch means the catalog changed while the
    /// merge ran; the catalog is left untouched and the caller retries on
    /// a later tick.
    pub fn apply(&self, outcome: CompactionOutcome) -> Result<AppliedCompaction, CompactionError> {
        let output_version = outcome.output.version;
        let removed = {
            let mut guard = self.meta.write();
            let removed = guard
                .catalog
                .swap(&outcome.inputs, outcome.output)
                .ok_or(CompactionError::CatalogChanged)?;
            if output_version.start == 0 {
                guard.deletes.drop_covered(output_version.end);
            }
            removed
        };
        tablet_event!(
            log::Level::Info,
            self.id,
            "compaction_apply",
            "kind={} output={} replaced={}",
            outcome.kind,
            output_version,
            removed.iter().map(|rs| rs.id).join(","),
        );
        Ok(AppliedCompaction {
            kind: outcome.kind,
            output_version,
            removed: removed.into_iter().map(|rs| rs.id).collect(),
        })
    }

    /// One full policy cycle: select, merge, apply. `Ok(None)` means there
    /// was nothing to do.
    pub async fn compact(&self) -> Result<Option<AppliedCompaction>, CompactionError> {
        let task = match self.create_compaction_task() {
            Some(task) => task,
            None => return Ok(None),
        };
        let ctx = RowsetWriterContext {
            tablet_id: self.id,
            partition_id: self.partition_id,
            rowset_id: self.ids.allocate(),
            version: task.output_version,
            path_prefix: None,
        };
        let executed = task
            .execute(
                self.store.as_ref(),
                &self.mem,
                self.shutdown.subscribe(),
                ctx,
            )
            .await;
        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_fatal() {
                    self.poison();
                }
                return Err(err);
            }
        };
        match self.apply(outcome) {
            Ok(applied) => Ok(Some(applied)),
            Err(err) => {
                if err.is_fatal() {
                    self.poison();
                }
                Err(err)
            }
        }
    }

    /// Signal in-flight tasks to abort; the tablet stops proposing work.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// An invariant violation stops this tablet, not the process.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        tablet_event!(
            log::Level::Error,
            self.id,
            "tablet_poisoned",
            "taken out of compaction scheduling",
        );
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        option::SizeTieredOptions,
        rowset::DeletePredicate,
        store::{Chunk, MemStore},
    };

    fn options() -> StoreOptions {
        StoreOptions::new().size_tiered_compaction(
            SizeTieredOptions::default()
                .min_level_size(4096)
                .min_cumulative_deltas(2),
        )
    }

    struct Harness {
        tablet: Arc<Tablet>,
        store: Arc<MemStore>,
        ids: RowsetIdAllocator,
    }

    impl Harness {
        fn new(options: &StoreOptions) -> Self {
            let store = Arc::new(MemStore::new());
            let tablet = Tablet::open(
                12345,
                10,
                Vec::new(),
                options,
                store.clone(),
                Arc::new(MemoryTracker::unbounded()),
            )
            .unwrap();
            Self {
                tablet,
                store,
                ids: RowsetIdAllocator::new(12345),
            }
        }

        /// Ingest a data rowset whose stored payload matches its meta size.
        fn ingest(&self, v: u64, size: u64) {
            let id = self.ids.allocate();
            let rows = size / 32;
            self.store
                .put_chunks(id, vec![Chunk::new(rows, vec![0; size as usize])]);
            self.tablet
                .add_rowset(RowsetMeta::data(
                    id,
                    Version::singleton(v),
                    rows,
                    size,
                    1,
                    unix_now(),
                ))
                .unwrap();
        }

        fn ingest_tombstone(&self, v: u64) {
            self.tablet
                .add_rowset(RowsetMeta::tombstone(
                    self.ids.allocate(),
                    DeletePredicate::is_in(v, "k1", vec!["0".into()]),
                    unix_now(),
                ))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn need_create_apply_cycle() {
        let harness = Harness::new(&options());
        for v in 0..6 {
            harness.ingest(v, 4096);
        }
        assert!(harness.tablet.need_compaction());

        let applied = harness.tablet.compact().await.unwrap().expect("applied");
        assert_eq!(applied.kind, CompactionKind::Cumulative);
        assert_eq!(applied.output_version, Version::new(0, 5));
        assert_eq!(applied.removed.len(), 6);

        assert_eq!(harness.tablet.list_versions(), vec![Version::new(0, 5)]);
        assert!(!harness.tablet.need_compaction());

        // The merged payload landed in the store under the new rowset.
        let output = &harness.tablet.rowset_metas()[0];
        assert_eq!(output.num_rows, 6 * (4096 / 32));
        assert!(harness.store.contains(output.id));
    }

    #[tokio::test]
    async fn stale_outcome_is_rejected_and_catalog_untouched() {
        let harness = Harness::new(&options());
        harness.ingest(0, 4096);
        harness.ingest(1, 4096);

        let task = harness.tablet.create_compaction_task().expect("task");
        let ctx = RowsetWriterContext {
            tablet_id: 12345,
            partition_id: 10,
            rowset_id: harness.ids.allocate(),
            version: task.output_version,
            path_prefix: None,
        };
        let (_tx, cancel) = watch::channel(false);
        let outcome = task
            .execute(
                harness.store.as_ref(),
                &MemoryTracker::unbounded(),
                cancel,
                ctx,
            )
            .await
            .unwrap();

        harness.tablet.apply(outcome.clone()).unwrap();
        // The same outcome cannot apply twice: its inputs are gone.
        let err = harness.tablet.apply(outcome).unwrap_err();
        assert!(matches!(err, CompactionError::CatalogChanged));
        assert_eq!(harness.tablet.list_versions(), vec![Version::new(0, 1)]);
    }

    #[tokio::test]
    async fn predicates_survive_until_a_base_anchored_swap() {
        let harness = Harness::new(&options());
        harness.ingest(0, 4096);
        harness.ingest_tombstone(1);
        harness.ingest(2, 4096);
        assert_eq!(harness.tablet.tracked_deletes(), vec![1]);

        let applied = harness.tablet.compact().await.unwrap().expect("applied");
        assert_eq!(applied.output_version, Version::new(0, 2));
        assert!(harness.tablet.tracked_deletes().is_empty());
    }

    #[tokio::test]
    async fn disabled_strategy_proposes_nothing() {
        let harness = Harness::new(&options().disable_compaction());
        for v in 0..6 {
            harness.ingest(v, 4096);
        }
        assert!(!harness.tablet.need_compaction());
        assert!(harness.tablet.create_compaction_task().is_none());
        assert!(harness.tablet.compact().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_new_work() {
        let harness = Harness::new(&options());
        for v in 0..4 {
            harness.ingest(v, 4096);
        }
        assert!(harness.tablet.need_compaction());
        harness.tablet.shutdown();
        assert!(!harness.tablet.need_compaction());
        assert!(harness.tablet.create_compaction_task().is_none());
        assert_eq!(harness.tablet.version_count(), 4);
    }

    #[tokio::test]
    async fn poisoned_tablet_is_out_of_scheduling() {
        let harness = Harness::new(&options());
        for v in 0..4 {
            harness.ingest(v, 4096);
        }
        harness.tablet.poison();
        assert!(harness.tablet.is_poisoned());
        assert!(!harness.tablet.need_compaction());
        assert!(harness.tablet.create_compaction_task().is_none());
    }

    #[tokio::test]
    async fn overlapping_ingest_is_rejected() {
        let harness = Harness::new(&options());
        harness.ingest(0, 4096);
        let err = harness
            .tablet
            .add_rowset(RowsetMeta::data(
                harness.ids.allocate(),
                Version::new(0, 1),
                1,
                4096,
                1,
                unix_now(),
            ))
            .unwrap_err();
        assert!(matches!(err, TabletError::Catalog { .. }));
    }
}
