//! All counters use `Relaxed` ordering.  Individual counter values are
//! eventually consistent; cross-counter snapshots may be transiently
//! inconsistent.  This is acceptable for diagnostic display.  Do NOT use
//! these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero.  Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes handed out by the OS pager since process start
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Bytes returned to the OS pager since process start
crate::sync::static_atomic! {
    pub static TOTAL_UNMAPPED: Counter = Counter::new();
}
// Currently mapped extents (pages of any kind)
crate::sync::static_atomic! {
    pub static LIVE_PAGES: Counter = Counter::new();
}
// Collector loop iterations
crate::sync::static_atomic! {
    pub static COLLECTOR_PASSES: Counter = Counter::new();
}
// Blocks the collector has published to ring buffers
crate::sync::static_atomic! {
    pub static BLOCKS_PUBLISHED: Counter = Counter::new();
}
