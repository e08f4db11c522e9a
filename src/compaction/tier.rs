use crate::{option::SizeTieredOptions, rowset::RowsetMeta};

/// The minimum working tier: anything at or below the floor size lands here.
pub(crate) const MIN_TIER: u8 = 2;

/// Geometric size ladder mapping a rowset's disk size to a tier.
///
/// Tier `L` covers sizes in `[size0 * M^(L-2), size0 * M^(L-1))`, so that
/// merging a full tier's worth of rowsets classifies roughly one tier up.
#[derive(Clone, Copy, Debug)]
pub struct TierLadder {
    min_level_size: u64,
    level_multiple: u64,
    max_level: u8,
}

impl TierLadder {
    pub fn new(options: &SizeTieredOptions) -> Self {
        Self {
            min_level_size: options.min_level_size.max(1),
            level_multiple: options.level_multiple.max(2),
            max_level: options.max_level.max(MIN_TIER),
        }
    }

    /// Tier of a rowset with `size` bytes of data. Monotonic in `size`.
    pub fn tier_of_size(&self, size: u64) -> u8 {
        let clamped = size.max(self.min_level_size);
        let mut bound = self.min_level_size.saturating_mul(self.level_multiple);
        let mut tier = MIN_TIER;
        while tier < self.max_level && clamped >= bound {
            bound = bound.saturating_mul(self.level_multiple);
            tier += 1;
        }
        tier
    }

    /// Tier assignment for one gap-free island of the catalog.
    ///
    /// Tombstones have no data of their own; they inherit the tier of the
    /// next non-tombstone rowset to their right, or the nearest one to
    /// their left if the island ends in tombstones. An all-tombstone
    /// island sits at the minimum tier.
    pub fn assign(&self, island: &[RowsetMeta]) -> Vec<u8> {
        let mut tiers = vec![MIN_TIER; island.len()];
        let mut pending_from = island.len();
        let mut last_data_tier = None;
        for (idx, rs) in island.iter().enumerate() {
            if rs.is_tombstone() {
                pending_from = pending_from.min(idx);
                continue;
            }
            let tier = self.tier_of_size(rs.data_disk_size);
            tiers[idx] = tier;
            for slot in tiers[pending_from..idx].iter_mut() {
                *slot = tier;
            }
            pending_from = island.len();
            last_data_tier = Some(tier);
        }
        if pending_from < island.len() {
            if let Some(tier) = last_data_tier {
                for slot in tiers[pending_from..].iter_mut() {
                    *slot = tier;
                }
            }
        }
        tiers
    }
}
