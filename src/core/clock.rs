use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-run counter ordering builder births against deletions.
#[derive(Debug, Default)]
pub struct EpochClock {
    next: AtomicU64,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
