use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide budget for concurrent merge buffers.
///
/// Tasks reserve an estimate of their working set before reading any input
/// and fail cleanly when the budget is spent; the reservation is released
/// when the guard drops, whether the merge succeeded or not.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryTracker {
    /// Tracker enforcing `limit` bytes across all concurrent reservations.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Tracker that never rejects a reservation.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Try to reserve `bytes`; on failure returns the bytes still available.
    pub fn try_reserve(&self, bytes: usize) -> Result<MemoryReservation<'_>, usize> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let available = self.limit.saturating_sub(current);
            if bytes > available {
                return Err(available);
            }
            match self.used.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(MemoryReservation {
                    tracker: self,
                    bytes,
                }),
                Err(observed) => current = observed,
            }
        }
    }
}

/// RAII guard for one reservation; releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation<'a> {
    tracker: &'a MemoryTracker,
    bytes: usize,
}

impl MemoryReservation<'_> {
    /// Bytes held by this reservation.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation<'_> {
    fn drop(&mut self) {
        self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryTracker;

    #[test]
    fn reservations_release_on_drop() {
        let tracker = MemoryTracker::new(100);
        let a = tracker.try_reserve(60).unwrap();
        assert_eq!(tracker.used(), 60);
        assert_eq!(tracker.try_reserve(50).unwrap_err(), 40);
        drop(a);
        assert_eq!(tracker.used(), 0);
        let _b = tracker.try_reserve(100).unwrap();
    }

    #[test]
    fn unbounded_never_rejects() {
        let tracker = MemoryTracker::unbounded();
        let _a = tracker.try_reserve(usize::MAX / 2).unwrap();
        let _b = tracker.try_reserve(usize::MAX / 2).unwrap();
    }
}
