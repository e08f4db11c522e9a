//! Background compaction: one poll loop per storage root, a bounded worker
//! pool across tablets, and a cleaner that removes swapped-out rowsets.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::Semaphore, time::Instant};

use crate::{
    logging::{tablet_event, LOG_TARGET},
    option::StoreOptions,
    rowset::RowsetId,
    store::RowsetStore,
    tablet::{Tablet, TabletId},
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Message handed to the cleaner after a successful swap.
pub enum CleanTag {
    Swept {
        tablet_id: TabletId,
        rowsets: Vec<RowsetId>,
    },
}

/// Removes rowsets from the physical store once they have been swapped out
/// of a catalog. Replaced rowsets are only ever deleted here, after the
/// replacement committed.
pub struct Cleaner {
    tag_recv: Receiver<CleanTag>,
    store: Arc<dyn RowsetStore>,
}

impl Cleaner {
    pub fn new(options: &StoreOptions, store: Arc<dyn RowsetStore>) -> (Self, Sender<CleanTag>) {
        let (tag_send, tag_recv) = flume::bounded(options.clean_channel_buffer);
        (Cleaner { tag_recv, store }, tag_send)
    }

    /// Drain tags until every sender is gone.
    pub async fn listen(&self) {
        while let Ok(tag) = self.tag_recv.recv_async().await {
            match tag {
                CleanTag::Swept { tablet_id, rowsets } => {
                    for id in rowsets {
                        if let Err(err) = self.store.delete_rowset(id).await {
                            tablet_event!(
                                log::Level::Warn,
                                tablet_id,
                                "clean_failed",
                                "rowset={} error={}",
                                id,
                                err,
                            );
                        } else {
                            tablet_event!(
                                log::Level::Debug,
                                tablet_id,
                                "rowset_swept",
                                "rowset={}",
                                id,
                            );
                        }
                    }
                }
            }
        }
    }
}

struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Polls registered tablets and runs their compactions on a bounded worker
/// pool. Within a single tablet at most one task is in flight; failures
/// back off exponentially per tablet, and invariant violations take the
/// tablet out of scheduling entirely.
pub struct CompactionScheduler {
    options: StoreOptions,
    tablets: RwLock<HashMap<TabletId, Arc<Tablet>>>,
    inflight: Mutex<HashSet<TabletId>>,
    backoff: Mutex<HashMap<TabletId, Backoff>>,
    semaphore: Arc<Semaphore>,
    clean_send: Sender<CleanTag>,
}

impl CompactionScheduler {
    pub fn new(options: StoreOptions, clean_send: Sender<CleanTag>) -> Arc<Self> {
        let permits = options.max_compaction_concurrency;
        Arc::new(Self {
            options,
            tablets: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            backoff: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(permits)),
            clean_send,
        })
    }

    pub fn register(&self, tablet: Arc<Tablet>) {
        self.tablets.write().insert(tablet.id(), tablet);
    }

    pub fn deregister(&self, tablet_id: TabletId) {
        self.tablets.write().remove(&tablet_id);
        self.backoff.lock().remove(&tablet_id);
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.read().len()
    }

    /// Poll until a stop message arrives (or every stop sender is gone).
    pub async fn run(self: Arc<Self>, stop: Receiver<()>) {
        loop {
            Self::tick(&self);
            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = stop.recv_async() => break,
            }
        }
        log::info!(target: LOG_TARGET, "event=scheduler_stopped");
    }

    fn tick(this: &Arc<Self>) {
        let tablets: Vec<Arc<Tablet>> = this.tablets.read().values().cloned().collect();
        for tablet in tablets {
            let tablet_id = tablet.id();
            if tablet.is_poisoned() {
                tablet_event!(
                    log::Level::Error,
                    tablet_id,
                    "tablet_dropped",
                    "reason=poisoned",
                );
                this.deregister(tablet_id);
                continue;
            }
            if this.in_backoff(tablet_id) || this.inflight.lock().contains(&tablet_id) {
                continue;
            }
            if !tablet.need_compaction() {
                continue;
            }
            let Ok(permit) = this.semaphore.clone().try_acquire_owned() else {
                // Pool saturated; the next tick picks the rest up.
                break;
            };
            this.inflight.lock().insert(tablet_id);
            let scheduler = this.clone();
            tokio::spawn(async move {
                let result = tablet.compact().await;
                drop(permit);
                scheduler.inflight.lock().remove(&tablet_id);
                match result {
                    Ok(Some(applied)) => {
                        scheduler.backoff.lock().remove(&tablet_id);
                        let _ = scheduler
                            .clean_send
                            .send_async(CleanTag::Swept {
                                tablet_id,
                                rowsets: applied.removed,
                            })
                            .await;
                    }
                    Ok(None) => {}
                    Err(err) if err.is_fatal() => {
                        tablet_event!(
                            log::Level::Error,
                            tablet_id,
                            "compaction_fatal",
                            "error={}",
                            err,
                        );
                        scheduler.deregister(tablet_id);
                    }
                    Err(err) => {
                        let delay = scheduler.bump_backoff(tablet_id);
                        tablet_event!(
                            log::Level::Warn,
                            tablet_id,
                            "compaction_failed",
                            "retry_in={:?} error={}",
                            delay,
                            err,
                        );
                    }
                }
            });
        }
    }

    fn in_backoff(&self, tablet_id: TabletId) -> bool {
        self.backoff
            .lock()
            .get(&tablet_id)
            .is_some_and(|b| b.retry_at > Instant::now())
    }

    fn bump_backoff(&self, tablet_id: TabletId) -> Duration {
        let mut guard = self.backoff.lock();
        let failures = guard.get(&tablet_id).map_or(0, |b| b.failures) + 1;
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << (failures - 1).min(16))
            .min(BACKOFF_CAP);
        guard.insert(
            tablet_id,
            Backoff {
                failures,
                retry_at: Instant::now() + delay,
            },
        );
        delay
    }
}
