//! Block header and the raw-pointer operations on it.
//!
//! This module is the single place where block memory is reinterpreted:
//! header fields are reached through raw place projections (never a
//! `&mut Block`), because foreign threads read `owner`, `object_size` and
//! the public half concurrently with the owner's writes to other fields.
//!
//! ```text
//!   +-------------------------+  block (16 KiB aligned)
//!   | local half   (64 bytes) |  owner-only except `owner` (atomic)
//!   | public half  (64 bytes) |  written by foreign threads
//!   +-------------------------+  block + BLOCK_HEADER_SIZE
//!   |          ...            |
//!   |   objects, carved by    |
//!   |   the bump pointer from |
//!   |   the end downwards     |
//!   +-------------------------+  block + BLOCK_SIZE
//! ```

use super::lifo::PoolLink;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::ptr::{self, NonNull};

pub(crate) const BLOCK_SIZE: usize = 16 * 1024;

/// Header size. Equal to 128 in normal builds; loom's instrumented atomics
/// are larger, and every derived constant follows.
pub(crate) const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<Block>();

#[cfg(not(loom))]
const _: () = assert!(BLOCK_HEADER_SIZE == 128);

/// Usable bytes behind the header.
pub(crate) const BLOCK_USABLE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Sentinel for `public_free_list` and `next_privatizable`. Never a valid
/// object or bin address (the low bit is always clear on those).
pub(crate) const UNUSABLE: usize = 0x1;

/// Tag identifying memory handed out by this allocator.
pub(crate) const MALLOC_UNIQUE_ID: u64 = 0xE3C7_AF89_A1E2_D8C1;

/// A full block becomes usable again once this share of it is free.
const EMPTY_ENOUGH_NUMERATOR: usize = 1;
const EMPTY_ENOUGH_DENOMINATOR: usize = 4;

#[inline]
pub(crate) fn is_solid(link: usize) -> bool {
    (link | UNUSABLE) != UNUSABLE
}

/// One-word intrusive node overlaid on freed objects.
#[repr(C)]
pub(crate) struct FreeObject {
    pub(crate) next: *mut FreeObject,
}

#[repr(C, align(64))]
struct LocalFields {
    /// Link used while the block (or the chunk it heads) is in a `LifoPool`.
    pool_link: PoolLink,
    unique_id: u64,
    next: *mut Block,
    prev: *mut Block,
    owner: AtomicU64,
    /// Next bump allocation address, or 0 once the bump region is used up.
    /// For a free chunk in the block pool it holds the chunk's end address.
    bump: usize,
    free_list: *mut FreeObject,
    /// Both fit in 16 bits: objects are smaller than a block and a block
    /// holds at most `BLOCK_USABLE / 8` of them.
    object_size: u16,
    allocated_count: u16,
    is_full: bool,
}

#[repr(C, align(64))]
struct PublicFields {
    public_free_list: AtomicUsize,
    next_privatizable: AtomicUsize,
}

#[repr(C)]
pub(crate) struct Block {
    local: LocalFields,
    public: PublicFields,
}

/// Copyable handle to a block header.
///
/// Methods documented "owner only" must be called by the thread whose arena
/// id is stored in `owner`, or by a thread that has exclusive access to an
/// unowned block (just popped from a pool).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockRef(NonNull<Block>);

macro_rules! field {
    ($self:ident . $half:ident . $f:ident) => {
        // Safety: `BlockRef` always points to a mapped, initialised header.
        unsafe { (*$self.0.as_ptr()).$half.$f }
    };
}

macro_rules! set_field {
    ($self:ident . $half:ident . $f:ident = $v:expr) => {
        // Safety: `BlockRef` always points to a mapped, initialised header,
        // and plain fields are only written by the owner.
        unsafe { (*$self.0.as_ptr()).$half.$f = $v }
    };
}

impl BlockRef {
    /// # Safety
    /// `ptr` must point to a `BLOCK_SIZE`-aligned, mapped block whose header
    /// has been written with [`write_fresh`](Self::write_fresh).
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: NonNull<Block>) -> Self {
        debug_assert!((ptr.as_ptr() as usize).is_multiple_of(BLOCK_SIZE));
        Self(ptr)
    }

    /// Block containing `object`.
    ///
    /// # Safety
    /// `object` must lie inside a block handed out by this allocator.
    #[inline]
    pub(crate) unsafe fn containing(object: NonNull<u8>) -> Self {
        let addr = object.as_ptr() as usize & !(BLOCK_SIZE - 1);
        // Safety: upheld by caller; block addresses are never null.
        unsafe { Self::from_raw(NonNull::new_unchecked(addr as *mut Block)) }
    }

    /// # Safety
    /// `link` must have come from a pool that only holds block headers.
    #[inline]
    pub(crate) unsafe fn from_pool_link(link: NonNull<PoolLink>) -> Self {
        // Safety: `pool_link` is the first field of a `#[repr(C)]` header.
        unsafe { Self::from_raw(link.cast::<Block>()) }
    }

    #[inline]
    pub(crate) fn pool_link(self) -> NonNull<PoolLink> {
        self.0.cast::<PoolLink>()
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut Block {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Write a complete header into never-used block memory, describing an
    /// unowned free chunk that ends at `chunk_end`.
    ///
    /// # Safety
    /// `ptr` must be `BLOCK_SIZE`-aligned, mapped, and not reachable by any
    /// other thread (in particular, not from any pool).
    pub(crate) unsafe fn write_fresh(ptr: NonNull<Block>, chunk_end: usize) -> Self {
        let header = Block {
            local: LocalFields {
                pool_link: PoolLink::new(),
                unique_id: 0,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                owner: AtomicU64::new(0),
                bump: chunk_end,
                free_list: ptr::null_mut(),
                object_size: 0,
                allocated_count: 0,
                is_full: false,
            },
            public: PublicFields {
                public_free_list: AtomicUsize::new(0),
                next_privatizable: AtomicUsize::new(0),
            },
        };
        // Safety: upheld by caller.
        unsafe {
            ptr.as_ptr().write(header);
            Self::from_raw(ptr)
        }
    }

    /// Turn an empty block into an active block of one size class.
    /// `next_privatizable` is the owning bin's address (or `UNUSABLE` for
    /// blocks no bin will ever own).
    pub(crate) fn init_empty(self, object_size: usize, owner: u64, next_privatizable: usize) {
        debug_assert!(object_size > 0 && object_size < BLOCK_USABLE);
        #[allow(clippy::cast_possible_truncation)]
        let object_size_u16 = object_size as u16;
        set_field!(self.local.unique_id = MALLOC_UNIQUE_ID);
        set_field!(self.local.next = ptr::null_mut());
        set_field!(self.local.prev = ptr::null_mut());
        set_field!(self.local.object_size = object_size_u16);
        set_field!(self.local.bump = self.addr() + BLOCK_SIZE - object_size);
        set_field!(self.local.free_list = ptr::null_mut());
        set_field!(self.local.allocated_count = 0);
        set_field!(self.local.is_full = false);
        self.owner_atomic().store(owner, Ordering::Relaxed);
        self.public_atomic().store(0, Ordering::Relaxed);
        self.next_privatizable_atomic()
            .store(next_privatizable, Ordering::Relaxed);
    }

    /// Wipe an empty block back into a one-block free chunk.
    pub(crate) fn reset_to_chunk(self) {
        debug_assert_eq!(self.allocated_count(), 0);
        debug_assert_eq!(self.public_free_list(), 0);
        set_field!(self.local.unique_id = 0);
        set_field!(self.local.next = ptr::null_mut());
        set_field!(self.local.prev = ptr::null_mut());
        set_field!(self.local.object_size = 0);
        set_field!(self.local.bump = self.addr() + BLOCK_SIZE);
        set_field!(self.local.free_list = ptr::null_mut());
        set_field!(self.local.allocated_count = 0);
        set_field!(self.local.is_full = false);
        self.owner_atomic().store(0, Ordering::Relaxed);
        self.public_atomic().store(0, Ordering::Relaxed);
        self.next_privatizable_atomic().store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    #[inline]
    fn owner_atomic(&self) -> &AtomicU64 {
        // Safety: header is mapped; the reference covers one atomic field.
        unsafe { &(*self.0.as_ptr()).local.owner }
    }

    #[inline]
    fn public_atomic(&self) -> &AtomicUsize {
        // Safety: header is mapped; the reference covers one atomic field.
        unsafe { &(*self.0.as_ptr()).public.public_free_list }
    }

    #[inline]
    fn next_privatizable_atomic(&self) -> &AtomicUsize {
        // Safety: header is mapped; the reference covers one atomic field.
        unsafe { &(*self.0.as_ptr()).public.next_privatizable }
    }

    #[inline]
    pub(crate) fn owner(self) -> u64 {
        self.owner_atomic().load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_owner(self, owner: u64) {
        self.owner_atomic().store(owner, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn unique_id(self) -> u64 {
        field!(self.local.unique_id)
    }

    #[inline]
    pub(crate) fn object_size(self) -> usize {
        field!(self.local.object_size) as usize
    }

    #[inline]
    pub(crate) fn allocated_count(self) -> u32 {
        u32::from(field!(self.local.allocated_count))
    }

    #[inline]
    fn set_allocated_count(self, count: u32) {
        debug_assert!(count as usize <= BLOCK_USABLE / 8);
        #[allow(clippy::cast_possible_truncation)]
        set_field!(self.local.allocated_count = count as u16);
    }

    #[inline]
    pub(crate) fn is_full(self) -> bool {
        field!(self.local.is_full)
    }

    #[inline]
    pub(crate) fn has_bump(self) -> bool {
        field!(self.local.bump) != 0
    }

    #[inline]
    pub(crate) fn next(self) -> Option<BlockRef> {
        NonNull::new(field!(self.local.next)).map(BlockRef)
    }

    #[inline]
    pub(crate) fn prev(self) -> Option<BlockRef> {
        NonNull::new(field!(self.local.prev)).map(BlockRef)
    }

    #[inline]
    pub(crate) fn set_next(self, next: Option<BlockRef>) {
        set_field!(self.local.next = next.map_or(ptr::null_mut(), BlockRef::as_ptr));
    }

    #[inline]
    pub(crate) fn set_prev(self, prev: Option<BlockRef>) {
        set_field!(self.local.prev = prev.map_or(ptr::null_mut(), BlockRef::as_ptr));
    }

    /// Raw head of the public free list (0, `UNUSABLE` or an object).
    #[inline]
    pub(crate) fn public_free_list(self) -> usize {
        self.public_atomic().load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn next_privatizable(self) -> usize {
        self.next_privatizable_atomic().load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next_privatizable(self, value: usize) {
        self.next_privatizable_atomic()
            .store(value, Ordering::Release);
    }

    /// Chunk end for a block taken from the free-block pool.
    #[inline]
    pub(crate) fn chunk_end(self) -> usize {
        field!(self.local.bump)
    }

    #[inline]
    pub(crate) fn set_chunk_end(self, end: usize) {
        set_field!(self.local.bump = end);
    }

    // ------------------------------------------------------------------
    // Owner-side allocation
    // ------------------------------------------------------------------

    /// Pop from the local free list. Owner only.
    #[inline]
    pub(crate) fn allocate_from_free_list(self) -> Option<NonNull<u8>> {
        let head = NonNull::new(field!(self.local.free_list))?;
        // Safety: free-list nodes are freed objects inside this block.
        let next = unsafe { (*head.as_ptr()).next };
        set_field!(self.local.free_list = next);
        debug_assert!((self.allocated_count() as usize) < BLOCK_USABLE / self.object_size());
        self.set_allocated_count(self.allocated_count() + 1);
        Some(head.cast::<u8>())
    }

    /// Carve the next object from the bump region. Owner only.
    #[inline]
    pub(crate) fn allocate_from_bump(self) -> Option<NonNull<u8>> {
        let result = field!(self.local.bump);
        if result == 0 {
            return None;
        }
        let object_size = self.object_size();
        let next = result - object_size;
        let next = if next < self.addr() + BLOCK_HEADER_SIZE { 0 } else { next };
        set_field!(self.local.bump = next);
        debug_assert!((self.allocated_count() as usize) < BLOCK_USABLE / object_size);
        self.set_allocated_count(self.allocated_count() + 1);
        NonNull::new(result as *mut u8)
    }

    /// Free list first (warmest memory), then the bump region. Marks the
    /// block full and fails when both are exhausted. Owner only.
    #[inline]
    pub(crate) fn allocate(self) -> Option<NonNull<u8>> {
        if let Some(obj) = self.allocate_from_free_list() {
            return Some(obj);
        }
        if let Some(obj) = self.allocate_from_bump() {
            return Some(obj);
        }
        set_field!(self.local.is_full = true);
        None
    }

    /// Push an object onto the local free list. Owner only.
    #[inline]
    pub(crate) fn free_local(self, object: NonNull<FreeObject>) {
        debug_assert!(self.allocated_count() > 0, "free into block with no live objects");
        let head = field!(self.local.free_list);
        // Safety: the object belongs to this block and is no longer in use.
        unsafe { (*object.as_ptr()).next = head };
        set_field!(self.local.free_list = object.as_ptr());
        self.set_allocated_count(self.allocated_count() - 1);
    }

    /// Decide whether the block can be allocated from again and record the
    /// answer in `is_full`. Owner only.
    ///
    /// `allocated_count` still includes objects sitting in the public free
    /// list, so privatizing first gives a more accurate answer.
    pub(crate) fn empty_enough_to_use(self) -> bool {
        if self.has_bump() {
            set_field!(self.local.is_full = false);
            return true;
        }
        let threshold =
            BLOCK_USABLE * (EMPTY_ENOUGH_DENOMINATOR - EMPTY_ENOUGH_NUMERATOR) / EMPTY_ENOUGH_DENOMINATOR;
        let live = self.allocated_count() as usize * self.object_size();
        let full = live > threshold;
        set_field!(self.local.is_full = full);
        !full
    }

    /// Reset an empty block so it bump-allocates from the top again.
    /// Owner only.
    pub(crate) fn restore_bump_ptr(self) {
        debug_assert_eq!(self.allocated_count(), 0);
        debug_assert_eq!(self.public_free_list(), 0);
        set_field!(self.local.bump = self.addr() + BLOCK_SIZE - self.object_size());
        set_field!(self.local.free_list = ptr::null_mut());
        set_field!(self.local.is_full = false);
    }

    // ------------------------------------------------------------------
    // Public free list
    // ------------------------------------------------------------------

    /// Push `object` onto the public free list from a non-owning thread.
    ///
    /// Returns `true` when this push turned an empty (NULL) list non-empty,
    /// i.e. it is the first foreign free of a new wave.
    pub(crate) fn push_public(self, object: NonNull<FreeObject>) -> bool {
        let public = self.public_atomic();
        let mut head = public.load(Ordering::Relaxed);
        loop {
            // Safety: the caller gave up `object`; it is exclusively ours
            // until the CAS publishes it.
            unsafe { (*object.as_ptr()).next = head as *mut FreeObject };
            // No backoff: this thread is making a change, not waiting for one.
            match public.compare_exchange_weak(
                head,
                object.as_ptr() as usize,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return head == 0,
                Err(current) => head = current,
            }
        }
    }

    /// Adopt every foreign free into the local free list. Owner only.
    ///
    /// The chain ends at NULL or at `UNUSABLE` (left by an orphan hand-off);
    /// nodes past `UNUSABLE` do not exist. Returns the number adopted.
    pub(crate) fn privatize_public_free_list(self) -> u32 {
        // AcqRel: a foreign push that finds the NULL left here must also see
        // the owner's latest `next_privatizable`.
        let head = self.public_atomic().swap(0, Ordering::AcqRel);
        debug_assert!(head != 0, "privatizing a block with an empty public free list");
        if !is_solid(head) {
            return 0;
        }
        let mut adopted = 1u32;
        let mut tail = head as *mut FreeObject;
        loop {
            // Safety: chain nodes are freed objects of this block, published
            // by the Release CAS in `push_public`.
            let next = unsafe { (*tail).next } as usize;
            if !is_solid(next) {
                break;
            }
            tail = next as *mut FreeObject;
            adopted += 1;
        }
        debug_assert!(self.allocated_count() >= adopted);
        self.set_allocated_count(self.allocated_count() - adopted);
        let local_head = field!(self.local.free_list);
        // Safety: `tail` is the last solid node of the chain.
        unsafe { (*tail).next = local_head };
        set_field!(self.local.free_list = head as *mut FreeObject);
        adopted
    }

    /// Mark an unowned-to-be block so that no later foreign free tries to
    /// reach a mailbox: CAS `public_free_list` from NULL to `UNUSABLE`.
    /// Returns `false` if a foreign free got there first.
    pub(crate) fn try_mark_public_unusable(self) -> bool {
        self.public_atomic()
            .compare_exchange(0, UNUSABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Object placement
    // ------------------------------------------------------------------

    /// Start of the object containing `address`, computed from the block end.
    /// Aligned allocations may hand out interior pointers of fitting-size
    /// objects.
    pub(crate) fn find_allocated_object(self, address: NonNull<u8>) -> NonNull<FreeObject> {
        let object_size = self.object_size();
        let addr = address.as_ptr() as usize;
        let offset = self.addr() + BLOCK_SIZE - addr;
        debug_assert!(offset <= BLOCK_USABLE, "address outside block payload");
        let rem = offset % object_size;
        let start = addr - if rem == 0 { 0 } else { object_size - rem };
        // Safety: `start` lies within the block payload, hence non-null.
        unsafe { NonNull::new_unchecked(start as *mut FreeObject) }
    }

    pub(crate) fn is_properly_placed(self, object: NonNull<FreeObject>) -> bool {
        (self.addr() + BLOCK_SIZE - object.as_ptr() as usize).is_multiple_of(self.object_size())
    }

    /// Bytes from `address` to the end of its object.
    pub(crate) fn capacity_from(self, address: NonNull<u8>) -> usize {
        let start = self.find_allocated_object(address).as_ptr() as usize;
        start + self.object_size() - address.as_ptr() as usize
    }
}

/// Heap-backed block for unit tests that do not need a `BlockSupply`.
#[cfg(all(test, not(loom)))]
pub(crate) mod test_util {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    pub(crate) struct TestBlock {
        pub(crate) block: BlockRef,
        layout: Layout,
    }

    impl TestBlock {
        pub(crate) fn new(object_size: usize, owner: u64) -> Self {
            Self::with_bin(object_size, owner, UNUSABLE)
        }

        pub(crate) fn with_bin(object_size: usize, owner: u64, next_privatizable: usize) -> Self {
            let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap();
            // Safety: Test code.
            let ptr = unsafe { alloc_zeroed(layout) };
            let nn = NonNull::new(ptr.cast::<Block>()).unwrap();
            // Safety: Test code; fresh memory.
            let block = unsafe { BlockRef::write_fresh(nn, ptr as usize + BLOCK_SIZE) };
            block.init_empty(object_size, owner, next_privatizable);
            Self { block, layout }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            // Safety: Test code.
            unsafe { dealloc(self.block.as_ptr().cast::<u8>(), self.layout) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::test_util::TestBlock;
    use super::*;

    #[test]
    fn test_header_is_two_cache_lines() {
        assert_eq!(std::mem::size_of::<Block>(), 128);
        assert_eq!(std::mem::align_of::<Block>(), 64);
    }

    #[test]
    fn test_bump_allocates_from_the_end() {
        let tb = TestBlock::new(64, 1);
        let b = tb.block;
        let first = b.allocate().unwrap();
        assert_eq!(first.as_ptr() as usize, b.addr() + BLOCK_SIZE - 64);
        let second = b.allocate().unwrap();
        assert_eq!(second.as_ptr() as usize, b.addr() + BLOCK_SIZE - 128);
        assert_eq!(b.allocated_count(), 2);
    }

    #[test]
    fn test_fill_block_then_full() {
        let tb = TestBlock::new(1792, 1);
        let b = tb.block;
        let mut n = 0;
        while b.allocate().is_some() {
            n += 1;
        }
        assert_eq!(n, 9);
        assert!(b.is_full());
        assert!(!b.has_bump());
        assert_eq!(b.allocated_count(), 9);
    }

    #[test]
    fn test_local_free_list_is_preferred() {
        let tb = TestBlock::new(32, 1);
        let b = tb.block;
        let a = b.allocate().unwrap();
        let _c = b.allocate().unwrap();
        b.free_local(a.cast());
        assert_eq!(b.allocated_count(), 1);
        assert_eq!(b.allocate(), Some(a));
    }

    #[test]
    fn test_empty_enough_threshold() {
        let tb = TestBlock::new(1024, 1);
        let b = tb.block;
        let mut objs = Vec::new();
        while let Some(p) = b.allocate() {
            objs.push(p);
        }
        assert_eq!(objs.len(), BLOCK_USABLE / 1024);
        assert!(!b.empty_enough_to_use());
        // Free until live bytes drop to 3/4 of the usable area.
        while b.allocated_count() as usize * 1024 > BLOCK_USABLE * 3 / 4 {
            b.free_local(objs.pop().unwrap().cast());
        }
        assert!(b.empty_enough_to_use());
        assert!(!b.is_full());
    }

    #[test]
    fn test_public_push_reports_first_wave_only() {
        let tb = TestBlock::new(16, 1);
        let b = tb.block;
        let x = b.allocate().unwrap();
        let y = b.allocate().unwrap();
        assert!(b.push_public(x.cast()));
        assert!(!b.push_public(y.cast()));
        assert_eq!(b.allocated_count(), 2);

        assert_eq!(b.privatize_public_free_list(), 2);
        assert_eq!(b.allocated_count(), 0);
        assert_eq!(b.public_free_list(), 0);
        // The next wave is reported again.
        let z = b.allocate().unwrap();
        assert!(b.push_public(z.cast()));
    }

    #[test]
    fn test_privatize_stops_at_unusable() {
        let tb = TestBlock::new(16, 1);
        let b = tb.block;
        let x = b.allocate().unwrap();
        assert!(b.try_mark_public_unusable());
        assert!(!b.try_mark_public_unusable());
        // A free landing on an UNUSABLE list is not a new wave.
        assert!(!b.push_public(x.cast()));
        assert_eq!(b.privatize_public_free_list(), 1);
        assert_eq!(b.allocated_count(), 0);
        assert_eq!(b.allocate(), Some(x));
    }

    #[test]
    fn test_privatize_bare_unusable_adopts_nothing() {
        let tb = TestBlock::new(16, 1);
        let b = tb.block;
        let _x = b.allocate().unwrap();
        assert!(b.try_mark_public_unusable());
        assert_eq!(b.privatize_public_free_list(), 0);
        assert_eq!(b.allocated_count(), 1);
        assert_eq!(b.public_free_list(), 0);
    }

    #[test]
    fn test_find_allocated_object_from_interior_pointer() {
        let tb = TestBlock::new(2688, 1);
        let b = tb.block;
        let obj = b.allocate().unwrap();
        let interior = NonNull::new(obj.as_ptr().wrapping_add(300)).unwrap();
        assert_eq!(b.find_allocated_object(interior).cast::<u8>(), obj);
        assert_eq!(b.find_allocated_object(obj).cast::<u8>(), obj);
        assert!(b.is_properly_placed(obj.cast()));
        assert_eq!(b.capacity_from(interior), 2688 - 300);
    }

    #[test]
    fn test_restore_bump_after_emptying() {
        let tb = TestBlock::new(512, 1);
        let b = tb.block;
        let a = b.allocate().unwrap();
        b.free_local(a.cast());
        b.restore_bump_ptr();
        assert_eq!(b.allocate(), Some(a), "bump restarts at the block end");
    }

    #[test]
    fn test_reset_to_chunk_clears_tag() {
        let tb = TestBlock::new(64, 1);
        let b = tb.block;
        assert_eq!(b.unique_id(), MALLOC_UNIQUE_ID);
        b.reset_to_chunk();
        assert_eq!(b.unique_id(), 0);
        assert_eq!(b.owner(), 0);
        assert_eq!(b.chunk_end(), b.addr() + BLOCK_SIZE);
    }

    #[test]
    fn test_is_solid() {
        assert!(!is_solid(0));
        assert!(!is_solid(UNUSABLE));
        assert!(is_solid(0x1000));
    }
}
