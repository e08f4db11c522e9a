//! End-to-end compaction over the directory store: real files in, one
//! merged file out, swapped inputs swept by the cleaner.

use std::{sync::Arc, time::Duration};

use strata::{
    Chunk, Cleaner, CompactionKind, CompactionScheduler, DirStore, MemoryTracker, RowsetIdAllocator,
    RowsetMeta, RowsetStore, RowsetWriterContext, SizeTieredOptions, StoreOptions, Tablet, Version,
};

fn test_options() -> StoreOptions {
    StoreOptions::new()
        .poll_interval(Duration::from_millis(10))
        .size_tiered_compaction(
            SizeTieredOptions::default()
                .min_level_size(4096)
                .min_cumulative_deltas(2),
        )
}

/// Write one single-chunk rowset through the store and register it with
/// the tablet, the way an ingest would.
async fn write_rowset(
    store: &Arc<DirStore>,
    ids: &RowsetIdAllocator,
    tablet: &Tablet,
    version: u64,
    chunk_bytes: usize,
) -> RowsetMeta {
    let ctx = RowsetWriterContext {
        tablet_id: tablet.id(),
        partition_id: tablet.partition_id(),
        rowset_id: ids.allocate(),
        version: Version::singleton(version),
        path_prefix: None,
    };
    let mut writer = store.create_writer(ctx).await.unwrap();
    writer
        .add_chunk(Chunk::new(
            (chunk_bytes / 32) as u64,
            vec![version as u8; chunk_bytes],
        ))
        .await
        .unwrap();
    writer.flush().await.unwrap();
    let meta = writer.build().await.unwrap();
    tablet.add_rowset(meta.clone()).unwrap();
    meta
}

fn files_in(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test(flavor = "multi_thread")]
async fn compacts_disk_rowsets_to_a_single_output() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::new(dir.path()));
    let options = test_options();
    let ids = RowsetIdAllocator::new(12345);
    let tablet = Tablet::open(
        12345,
        10,
        Vec::new(),
        &options,
        store.clone(),
        Arc::new(MemoryTracker::unbounded()),
    )
    .unwrap();

    for v in 0..6 {
        write_rowset(&store, &ids, &tablet, v, 4096).await;
    }
    assert_eq!(tablet.version_count(), 6);

    let mut applied_kinds = Vec::new();
    while let Some(applied) = tablet.compact().await.unwrap() {
        applied_kinds.push(applied.kind);
    }
    assert_eq!(applied_kinds, vec![CompactionKind::Cumulative]);
    assert_eq!(tablet.list_versions(), vec![Version::new(0, 5)]);

    // The merged rowset holds every input chunk in version order.
    let output = &tablet.rowset_metas()[0];
    let mut reader = store.open_reader(output).await.unwrap();
    let mut chunks = Vec::new();
    use futures::TryStreamExt;
    while let Some(chunk) = reader.try_next().await.unwrap() {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), 6);
    assert_eq!(chunks[0].data[0], 0);
    assert_eq!(chunks[5].data[0], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_base_fires_after_the_idle_interval() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::new(dir.path()));
    let options = StoreOptions::new().size_tiered_compaction(
        SizeTieredOptions::default()
            .min_level_size(4096)
            .min_cumulative_deltas(2)
            .base_compaction_interval(Duration::from_secs(1)),
    );
    let ids = RowsetIdAllocator::new(12345);
    let tablet = Tablet::open(
        12345,
        10,
        Vec::new(),
        &options,
        store.clone(),
        Arc::new(MemoryTracker::unbounded()),
    )
    .unwrap();

    // Strictly descending tiers: no cumulative candidate exists.
    write_rowset(&store, &ids, &tablet, 0, 110_000).await;
    write_rowset(&store, &ids, &tablet, 1, 30_000).await;
    write_rowset(&store, &ids, &tablet, 2, 5_000).await;
    assert!(tablet.compact().await.unwrap().is_none());
    assert_eq!(tablet.version_count(), 3);

    // Seconds-granularity timestamps: sleep well past the interval.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let applied = tablet.compact().await.unwrap().expect("forced base");
    assert_eq!(applied.kind, CompactionKind::Base);
    assert_eq!(tablet.list_versions(), vec![Version::new(0, 2)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_sweeps_replaced_files_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::new(dir.path()));
    let options = test_options();
    let ids = RowsetIdAllocator::new(77);
    let tablet = Tablet::open(
        77,
        10,
        Vec::new(),
        &options,
        store.clone(),
        Arc::new(MemoryTracker::unbounded()),
    )
    .unwrap();
    for v in 0..6 {
        write_rowset(&store, &ids, &tablet, v, 4096).await;
    }
    assert_eq!(files_in(dir.path()), 6);

    let (cleaner, clean_send) = Cleaner::new(&options, store.clone());
    let scheduler = CompactionScheduler::new(options.clone(), clean_send);
    scheduler.register(tablet.clone());

    let cleaner_handle = tokio::spawn(async move { cleaner.listen().await });
    let (stop_send, stop_recv) = flume::bounded(1);
    let run_handle = tokio::spawn(scheduler.clone().run(stop_recv));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(tablet.version_count() == 1 && files_in(dir.path()) == 1) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tablet did not converge: {} versions, {} files",
            tablet.version_count(),
            files_in(dir.path()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tablet.list_versions(), vec![Version::new(0, 5)]);

    stop_send.send(()).unwrap();
    run_handle.await.unwrap();
    drop(scheduler);
    cleaner_handle.await.unwrap();
}
