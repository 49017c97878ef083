use crate::sync::atomic::{AtomicU128, AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Intrusive link embedded at the front of every pool node.
///
/// Atomic so that a pop racing with a concurrent pop-then-push of the same
/// node reads a torn-free (if stale) value. The stale read is discarded by
/// the generation check in [`LifoPool::pop`].
#[repr(transparent)]
pub(crate) struct PoolLink(AtomicUsize);

impl PoolLink {
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(0))
    }
}

/// 128-bit tagged pointer for ABA-safe Treiber stack operations.
///
/// ```text
///   bits [127:64]  generation counter
///   bits [63:0]    node address
/// ```
///
/// The generation is bumped on every successful CAS, so a node that is
/// popped, reused and pushed back at the same address still fails a stale
/// compare-exchange.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut PoolLink, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    fn ptr(self) -> *mut PoolLink {
        (self.0 as usize) as *mut PoolLink
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// Lock-free LIFO stack of fixed-size memory regions.
///
/// Serves as the global fresh-block supply, as each size class's orphan
/// pool and as the list of OS regions to unmap on shutdown.
///
/// All-zero is a valid empty pool, so arrays of pools need no per-element
/// construction. Node memory must stay mapped for as long as the pool is
/// used: a pop may read the link of a node that another thread has just
/// taken.
pub(crate) struct LifoPool {
    top: AtomicU128,
}

// Safety: LifoPool only holds an atomic word; nodes are handed over whole.
unsafe impl Send for LifoPool {}
// Safety: all access goes through CAS on `top`.
unsafe impl Sync for LifoPool {}

impl LifoPool {
    pub(crate) const fn new() -> Self {
        Self {
            top: AtomicU128::new(TaggedPtr::NULL.0),
        }
    }

    /// Push `node`. The caller gives up the node until it is popped again.
    ///
    /// # Safety
    /// `node` must point to a live `PoolLink` at the front of a region that
    /// stays mapped while the pool is in use, and must not already be in
    /// any pool.
    pub(crate) unsafe fn push(&self, node: NonNull<PoolLink>) {
        let mut old = TaggedPtr(self.top.load(Ordering::Relaxed));
        loop {
            // Safety: the caller owns `node` until the CAS publishes it.
            unsafe { node.as_ref() }
                .0
                .store(old.ptr() as usize, Ordering::Relaxed);
            let new = TaggedPtr::new(node.as_ptr(), old.generation().wrapping_add(1));
            // Retrying is always safe: a failure only means another push or
            // pop won the race.
            match self
                .top
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => old = TaggedPtr(current),
            }
        }
    }

    /// Pop the most recently pushed node, if any.
    pub(crate) fn pop(&self) -> Option<NonNull<PoolLink>> {
        let mut old = TaggedPtr(self.top.load(Ordering::Acquire));
        loop {
            let node = NonNull::new(old.ptr())?;
            // Safety: node memory stays mapped while the pool is in use (see
            // `push`). If another thread took the node first, the value read
            // here is stale and the generation check below rejects it.
            let next = unsafe { node.as_ref() }.0.load(Ordering::Relaxed) as *mut PoolLink;
            let new = TaggedPtr::new(next, old.generation().wrapping_add(1));
            match self
                .top
                .compare_exchange_weak(old.0, new.0, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(node),
                Err(current) => old = TaggedPtr(current),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        TaggedPtr(self.top.load(Ordering::Acquire)).ptr().is_null()
    }
}

impl Default for LifoPool {
    fn default() -> Self {
        Self::new()
    }
}
