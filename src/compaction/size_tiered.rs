//! The size-tiered candidate selector.
//!
//! Selection order, first match wins: forced base on an aged anchored
//! prefix, backtrace to pull a pending delete down into the larger data it
//! still applies to, cumulative over the best same-ladder run, size-driven
//! base over the anchored prefix. Runs never cross version gaps; gaps
//! split the catalog into islands and every island is considered on its
//! own.

use crate::{
    catalog::{Catalog, DeleteIndex},
    compaction::{
        tier::{TierLadder, MIN_TIER},
        CompactionKind, CompactionTask, Selection, SkipReason,
    },
    logging::tablet_event,
    option::SizeTieredOptions,
    rowset::RowsetMeta,
    tablet::TabletId,
};

pub(crate) fn select(
    options: &SizeTieredOptions,
    tablet_id: TabletId,
    catalog: &Catalog,
    deletes: &DeleteIndex,
    now: i64,
) -> Selection {
    if catalog.is_empty() {
        return Selection::Skip(SkipReason::EmptyCatalog);
    }
    if catalog.len() < 2 {
        return Selection::Skip(SkipReason::SingleRowset);
    }

    let ladder = TierLadder::new(options);
    let islands = catalog.islands();
    // The prefix anchored at version 0, gap-free from the first ingest.
    // Base-flavoured work only ever happens here.
    let anchored = islands
        .first()
        .copied()
        .filter(|island| island[0].version.start == 0);

    if let Some(prefix) = anchored {
        if let Some(task) = forced_base(options, tablet_id, prefix, now) {
            return Selection::Compact(task);
        }
        if let Some(task) = backtrace(&ladder, tablet_id, prefix, deletes) {
            return Selection::Compact(task);
        }
    }

    if let Some(task) = cumulative(options, &ladder, tablet_id, &islands) {
        return Selection::Compact(task);
    }

    if let Some(prefix) = anchored {
        if let Some(task) = sized_base(options, tablet_id, prefix, islands.get(1).copied()) {
            return Selection::Compact(task);
        }
    }

    if catalog.iter().all(RowsetMeta::is_tombstone) {
        Selection::Skip(SkipReason::OnlyTombstones)
    } else {
        Selection::Skip(SkipReason::NoQualifiedRun)
    }
}

/// An aged anchored prefix is squashed regardless of tier shape so that
/// read amplification on cold tablets stays bounded. Trailing tombstones
/// ride along with the prefix.
fn forced_base(
    options: &SizeTieredOptions,
    tablet_id: TabletId,
    prefix: &[RowsetMeta],
    now: i64,
) -> Option<CompactionTask> {
    if prefix.len() < 2 || prefix.iter().all(RowsetMeta::is_tombstone) {
        return None;
    }
    let interval = options.base_compaction_interval.as_secs() as i64;
    let oldest = prefix.iter().map(|rs| rs.creation_time).min()?;
    if now.saturating_sub(oldest) <= interval {
        return None;
    }
    tablet_event!(
        log::Level::Info,
        tablet_id,
        "forced_base",
        "prefix_len={} oldest_age={}s",
        prefix.len(),
        now.saturating_sub(oldest),
    );
    Some(CompactionTask::over_run(
        tablet_id,
        CompactionKind::Base,
        prefix,
    ))
}

/// A delete predicate that has been folded into a data rowset keeps
/// applying to every older row until a base-anchored merge absorbs it. If
/// such a carrier sits at a strictly lower tier than data on its left, the
/// tombstone would orphan there and block cumulative work; pull it down by
/// merging a run ending at the carrier, extended left only until its
/// combined size first classifies at or above the tallest tier on the
/// carrier's left. Rowsets further left stay untouched; once the run has
/// flattened the ladder, an ordinary cumulative pass finishes the job.
fn backtrace(
    ladder: &TierLadder,
    tablet_id: TabletId,
    prefix: &[RowsetMeta],
    deletes: &DeleteIndex,
) -> Option<CompactionTask> {
    if prefix.len() < 2 {
        return None;
    }
    let tiers = ladder.assign(prefix);

    let mut max_left = 0u8;
    let mut carrier = None;
    for (idx, rs) in prefix.iter().enumerate() {
        if idx > 0
            && !rs.is_tombstone()
            && !deletes.effective_deletes(&rs.version).is_empty()
            && max_left > tiers[idx]
        {
            carrier = Some(idx);
        }
        max_left = max_left.max(tiers[idx]);
    }
    let carrier = carrier?;

    let target = tiers[..carrier].iter().copied().max().unwrap_or(MIN_TIER);
    let mut combined = prefix[carrier].data_disk_size;
    let mut begin = None;
    for idx in (0..carrier).rev() {
        combined += prefix[idx].data_disk_size;
        if ladder.tier_of_size(combined) >= target {
            begin = Some(idx);
            break;
        }
    }
    let begin = begin?;
    Some(CompactionTask::over_run(
        tablet_id,
        CompactionKind::Backtrace,
        &prefix[begin..=carrier],
    ))
}

struct Candidate<'a> {
    run: &'a [RowsetMeta],
    tier: u8,
}

/// Cumulative selection: within each island, a new run starts whenever a
/// rowset's tier drops strictly below the tier of the run's first rowset.
/// A strictly descending catalog therefore yields only singleton runs (no
/// profitable merge until newer rowsets accumulate), while an ascending
/// one stays a single run and is squashed whole. Tombstones are
/// transparent to the tier check through their inherited tier.
fn cumulative(
    options: &SizeTieredOptions,
    ladder: &TierLadder,
    tablet_id: TabletId,
    islands: &[&[RowsetMeta]],
) -> Option<CompactionTask> {
    let min_len = options.min_cumulative_deltas.max(2);
    let mut best: Option<Candidate> = None;

    for island in islands {
        let anchored = island[0].version.start == 0;
        let tiers = ladder.assign(island);
        let mut begin = 0;
        for idx in 1..=island.len() {
            if idx < island.len() && tiers[idx] >= tiers[begin] {
                continue;
            }
            if let Some(candidate) =
                qualify(&island[begin..idx], &tiers[begin..idx], anchored, min_len)
            {
                best = Some(match best {
                    Some(current) if !beats(&candidate, &current) => current,
                    _ => candidate,
                });
            }
            begin = idx;
        }
    }

    let best = best?;
    let cap = options.max_cumulative_deltas.max(1).min(best.run.len());
    Some(CompactionTask::over_run(
        tablet_id,
        CompactionKind::Cumulative,
        &best.run[..cap],
    ))
}

/// Apply the delete-ordering and length rules to one raw run.
fn qualify<'a>(
    run: &'a [RowsetMeta],
    tiers: &[u8],
    anchored: bool,
    min_len: usize,
) -> Option<Candidate<'a>> {
    // A run may not start at a tombstone whose predicate still awaits
    // versions missing below it; trim and let the rest qualify alone.
    let skip = if anchored {
        0
    } else {
        run.iter().take_while(|rs| rs.is_tombstone()).count()
    };
    let (run, tiers) = (&run[skip..], &tiers[skip..]);
    if run.len() < min_len || run.iter().all(RowsetMeta::is_tombstone) {
        return None;
    }
    Some(Candidate {
        run,
        tier: tiers[0],
    })
}

/// Longest run first; ties prefer the smallest starting tier (smallest
/// files, cheapest merge), then the smallest start version.
fn beats(challenger: &Candidate<'_>, incumbent: &Candidate<'_>) -> bool {
    let lhs = (
        challenger.run.len(),
        std::cmp::Reverse(challenger.tier),
        std::cmp::Reverse(challenger.run[0].version.start),
    );
    let rhs = (
        incumbent.run.len(),
        std::cmp::Reverse(incumbent.tier),
        std::cmp::Reverse(incumbent.run[0].version.start),
    );
    lhs > rhs
}

/// Size-driven base compaction: once the anchored prefix is long enough
/// and outweighs its right neighbour, fold it into a single base rowset.
fn sized_base(
    options: &SizeTieredOptions,
    tablet_id: TabletId,
    prefix: &[RowsetMeta],
    next_island: Option<&[RowsetMeta]>,
) -> Option<CompactionTask> {
    if prefix.len() < options.min_base_deltas.max(2)
        || prefix.iter().all(RowsetMeta::is_tombstone)
    {
        return None;
    }
    let total: u64 = prefix.iter().map(|rs| rs.data_disk_size).sum();
    if let Some(next) = next_island {
        if total <= next[0].data_disk_size {
            return None;
        }
    }
    Some(CompactionTask::over_run(
        tablet_id,
        CompactionKind::Base,
        prefix,
    ))
}
