use std::time::Duration;

/// Compaction strategy attached to a tablet. One of a family; the variant
/// carries its own options and the selector dispatches on it.
#[derive(Clone, Debug)]
pub enum CompactionStrategy {
    /// Size-tiered selection over the rowset catalog.
    SizeTiered(SizeTieredOptions),
    /// Never propose a task; used for tablets being drained or migrated.
    Disabled,
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy::SizeTiered(SizeTieredOptions::default())
    }
}

/// Knobs of the size-tiered policy.
#[derive(Clone, Debug)]
pub struct SizeTieredOptions {
    /// Geometric factor between consecutive tiers.
    pub level_multiple: u64,
    /// Highest tier ever assigned.
    pub max_level: u8,
    /// Floor size: anything at or below it classifies as the minimum
    /// working tier.
    pub min_level_size: u64,
    /// Minimum run length for a cumulative task.
    pub min_cumulative_deltas: usize,
    /// Cap on the run length of a cumulative task.
    pub max_cumulative_deltas: usize,
    /// Minimum anchored-prefix length for a size-driven base task.
    pub min_base_deltas: usize,
    /// Idle age of the oldest rowset after which a base compaction is
    /// forced over the anchored prefix.
    pub base_compaction_interval: Duration,
}

impl Default for SizeTieredOptions {
    fn default() -> Self {
        Self {
            level_multiple: 5,
            max_level: 7,
            min_level_size: 128 * 1024,
            min_cumulative_deltas: 5,
            max_cumulative_deltas: 1000,
            min_base_deltas: 10,
            base_compaction_interval: Duration::from_secs(86400),
        }
    }
}

impl SizeTieredOptions {
    /// Set the geometric factor between tiers.
    pub fn level_multiple(mut self, value: u64) -> Self {
        self.level_multiple = value;
        self
    }

    /// Set the highest tier.
    pub fn max_level(mut self, value: u8) -> Self {
        self.max_level = value;
        self
    }

    /// Set the floor size of the tier ladder.
    pub fn min_level_size(mut self, value: u64) -> Self {
        self.min_level_size = value;
        self
    }

    /// Set the minimum cumulative run length.
    pub fn min_cumulative_deltas(mut self, value: usize) -> Self {
        self.min_cumulative_deltas = value;
        self
    }

    /// Set the cumulative run length cap.
    pub fn max_cumulative_deltas(mut self, value: usize) -> Self {
        self.max_cumulative_deltas = value;
        self
    }

    /// Set the minimum prefix length for size-driven base compaction.
    pub fn min_base_deltas(mut self, value: usize) -> Self {
        self.min_base_deltas = value;
        self
    }

    /// Set the forced base compaction interval.
    pub fn base_compaction_interval(mut self, value: Duration) -> Self {
        self.base_compaction_interval = value;
        self
    }
}

/// Operating parameters of a storage root: scheduling, memory and the
/// default compaction strategy for its tablets. Process-wide configuration
/// is only the source of these values; the selector never consults it.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub(crate) max_compaction_concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) compaction_memory_limit: usize,
    pub(crate) clean_channel_buffer: usize,
    pub(crate) strategy: CompactionStrategy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_compaction_concurrency: 4,
            poll_interval: Duration::from_secs(1),
            compaction_memory_limit: usize::MAX,
            clean_channel_buffer: 10,
            strategy: CompactionStrategy::default(),
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on tasks running concurrently across all tablets.
    pub fn max_compaction_concurrency(mut self, value: usize) -> Self {
        self.max_compaction_concurrency = value.max(1);
        self
    }

    /// Interval at which the scheduler polls tablets.
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    /// Byte budget shared by all concurrent merge buffers.
    pub fn compaction_memory_limit(mut self, value: usize) -> Self {
        self.compaction_memory_limit = value;
        self
    }

    /// Buffered entries in the cleaner channel.
    pub fn clean_channel_buffer(mut self, value: usize) -> Self {
        self.clean_channel_buffer = value;
        self
    }

    /// Configure size-tiered compaction with custom options.
    pub fn size_tiered_compaction(mut self, options: SizeTieredOptions) -> Self {
        self.strategy = CompactionStrategy::SizeTiered(options);
        self
    }

    /// Disable background compaction for tablets opened with these options.
    pub fn disable_compaction(mut self) -> Self {
        self.strategy = CompactionStrategy::Disabled;
        self
    }

    /// The configured strategy.
    pub fn strategy(&self) -> &CompactionStrategy {
        &self.strategy
    }
}
