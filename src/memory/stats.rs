//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g. `blocks_returned` may briefly run ahead of
//! `blocks_carved` as seen by another thread). This is acceptable for
//! diagnostic display. Do NOT use these values for allocation decisions;
//! the memory budget has its own exact accounting in `BlockSupply`.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub(crate) struct Counter(AtomicIsize);

impl Counter {
    pub(crate) fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub(crate) fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Live counters owned by one `ScalableAllocator`.
#[derive(Default)]
pub(crate) struct AllocatorCounters {
    /// Bytes currently mapped for block regions.
    pub(crate) os_mapped: Counter,
    /// Bytes currently mapped for large objects.
    pub(crate) large_mapped: Counter,
    /// Blocks handed out by `get_empty_block`.
    pub(crate) blocks_carved: Counter,
    /// Blocks given back to the free-block pool.
    pub(crate) blocks_returned: Counter,
    /// Non-empty blocks left behind by exiting threads.
    pub(crate) blocks_orphaned: Counter,
    /// Orphans picked up by another arena.
    pub(crate) blocks_adopted: Counter,
    pub(crate) arenas_live: Counter,
}

impl AllocatorCounters {
    pub(crate) fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            os_mapped: self.os_mapped.get(),
            large_mapped: self.large_mapped.get(),
            blocks_carved: self.blocks_carved.get(),
            blocks_returned: self.blocks_returned.get(),
            blocks_orphaned: self.blocks_orphaned.get(),
            blocks_adopted: self.blocks_adopted.get(),
            arenas_live: self.arenas_live.get(),
        }
    }
}

/// Point-in-time copy of an allocator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub os_mapped: usize,
    pub large_mapped: usize,
    pub blocks_carved: usize,
    pub blocks_returned: usize,
    pub blocks_orphaned: usize,
    pub blocks_adopted: usize,
    pub arenas_live: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(7);
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_snapshot_copies_every_counter() {
        let counters = AllocatorCounters::default();
        counters.os_mapped.add(1 << 20);
        counters.blocks_carved.add(3);
        counters.blocks_returned.add(1);
        counters.arenas_live.add(2);
        counters.arenas_live.sub(1);
        let s = counters.snapshot();
        assert_eq!(s.os_mapped, 1 << 20);
        assert_eq!(s.blocks_carved, 3);
        assert_eq!(s.blocks_returned, 1);
        assert_eq!(s.arenas_live, 1);
        assert_eq!(s.large_mapped, 0);
    }
}
