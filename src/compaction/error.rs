use thiserror::Error;

/// Failures surfaced by compaction execution and apply. A negative
/// selection is not an error: the selector returns a skip reason instead.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("compaction io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compaction inputs changed before apply, retry later")]
    CatalogChanged,
    #[error("compaction memory exhausted: need {requested} bytes, {available} available")]
    MemoryExhausted { requested: usize, available: usize },
    #[error("compaction canceled: tablet is shutting down")]
    Canceled,
    #[error("compaction invariant violated: {0}")]
    Internal(String),
}

impl CompactionError {
    /// Whether the failure should take the tablet out of scheduling
    /// entirely rather than back off and retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompactionError::Internal(_))
    }
}
