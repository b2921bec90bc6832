use std::sync::atomic::{AtomicU64, Ordering};

/// A process-local Lamport clock.
///
/// Both operations are single atomic read-modify-write steps, so the clock can
/// be shared by reference between every connection task without a lock and
/// without losing updates.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock at a given value.
    pub fn starting_at(time: u64) -> Self {
        Self {
            time: AtomicU64::new(time),
        }
    }

    /// The current value, without advancing it.
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merges a timestamp received from another process:
    /// `time = max(time, received) + 1`. Returns the new value.
    pub fn observe(&self, received: u64) -> u64 {
        let mut current = self.time.load(Ordering::SeqCst);
        loop {
            let next = current.max(received) + 1;
            match self.time.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
