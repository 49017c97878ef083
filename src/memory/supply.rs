//! Global block supply: OS regions, the free-block pool, per-class orphan
//! pools and the memory budget.
//!
//! A region is `os_request_size` bytes plus one page of slack, so that it
//! can be aligned up to `BLOCK_SIZE` and still hold its own [`RegionRecord`].
//! The aligned part is cut into chunks of `blocks_per_chunk` blocks; only a
//! chunk's first block carries a header until blocks are carved from it.
//!
//! ```text
//!   base   aligned_start                                  end
//!   | rec? |  chunk 0 (16 blocks) | chunk 1 | ... | rec?  |
//! ```
//!
//! Region memory is released only when the supply is dropped, so a pool pop
//! that reads a stale node link always reads mapped memory.

use super::bin::Bin;
use super::block::{BLOCK_SIZE, Block, BlockRef, UNUSABLE};
use super::lifo::{LifoPool, PoolLink};
use super::size_class::NUM_BINS;
use super::stats::AllocatorCounters;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{hint, thread};
use std::ptr::NonNull;

/// Spins between yields while waiting out a mailbox post.
const SPINS_PER_YIELD: u32 = 256;

/// Bookkeeping stored inside each region's slack.
#[repr(C)]
struct RegionRecord {
    link: PoolLink,
    base: usize,
    len: usize,
}

pub(crate) struct BlockSupply {
    free_blocks: LifoPool,
    orphans: [LifoPool; NUM_BINS],
    regions: LifoPool,
    os_request_size: usize,
    blocks_per_chunk: usize,
    memory_limit: Option<usize>,
    /// Exact bytes currently mapped (regions and large objects).
    mapped: AtomicUsize,
    pub(crate) counters: AllocatorCounters,
}

impl BlockSupply {
    pub(crate) fn new(
        os_request_size: usize,
        blocks_per_chunk: usize,
        memory_limit: Option<usize>,
    ) -> Self {
        debug_assert!(os_request_size >= BLOCK_SIZE && os_request_size.is_multiple_of(BLOCK_SIZE));
        debug_assert!(blocks_per_chunk > 0);
        Self {
            free_blocks: LifoPool::new(),
            orphans: std::array::from_fn(|_| LifoPool::new()),
            regions: LifoPool::new(),
            os_request_size,
            blocks_per_chunk,
            memory_limit,
            mapped: AtomicUsize::new(0),
            counters: AllocatorCounters::default(),
        }
    }

    // ------------------------------------------------------------------
    // Budget and OS access
    // ------------------------------------------------------------------

    fn reserve(&self, bytes: usize) -> Result<(), VmError> {
        let Some(limit) = self.memory_limit else {
            self.mapped.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        };
        let mut current = self.mapped.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= limit => next,
                _ => {
                    return Err(VmError::BudgetExhausted {
                        requested: bytes,
                        limit,
                    });
                }
            };
            match self
                .mapped
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self, bytes: usize) {
        self.mapped.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Map `len` bytes against the budget.
    pub(crate) fn map(&self, len: usize) -> Result<NonNull<u8>, VmError> {
        self.reserve(len)?;
        // Safety: FFI-backed acquire of a fresh range.
        match unsafe { PlatformVmOps::acquire(len) } {
            Ok(ptr) => Ok(ptr),
            Err(e) => {
                self.unreserve(len);
                #[cfg(debug_assertions)]
                if let VmError::AcquireFailed(io) = &e {
                    // Only the raw code: formatting the message would allocate.
                    eprintln!(
                        "[memory] OS acquire of {len} bytes failed (os error {:?})",
                        io.raw_os_error(),
                    );
                }
                Err(e)
            }
        }
    }

    /// Give back a range obtained from [`map`](Self::map).
    ///
    /// # Safety
    /// `ptr`/`len` must describe a live mapping from this supply.
    pub(crate) unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        // Safety: upheld by caller.
        let res = unsafe { PlatformVmOps::release(ptr, len) };
        self.unreserve(len);
        res
    }

    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    /// Map one more region and push its chunks into the free-block pool.
    fn grow(&self) -> Result<(), VmError> {
        let len = self.os_request_size + PlatformVmOps::page_size();
        let base_ptr = self.map(len)?;
        let base = base_ptr.as_ptr() as usize;
        let end = base + len;
        let aligned_start = (base + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        let record_size = std::mem::size_of::<RegionRecord>();

        let (record_at, blocks_end) = if aligned_start - base >= record_size {
            (base, aligned_start + (end - aligned_start) / BLOCK_SIZE * BLOCK_SIZE)
        } else {
            let blocks = (end - aligned_start - record_size) / BLOCK_SIZE;
            let blocks_end = aligned_start + blocks * BLOCK_SIZE;
            (blocks_end, blocks_end)
        };
        debug_assert!(blocks_end > aligned_start);

        let record = record_at as *mut RegionRecord;
        // Safety: `record_at` is inside the fresh mapping and outside every
        // block; mappings are page-aligned, which covers the record's alignment.
        unsafe {
            record.write(RegionRecord {
                link: PoolLink::new(),
                base,
                len,
            });
            self.regions.push(NonNull::new_unchecked(record).cast::<PoolLink>());
        }
        self.counters.os_mapped.add(len);

        let chunk_bytes = self.blocks_per_chunk * BLOCK_SIZE;
        let mut chunk = aligned_start;
        while chunk < blocks_end {
            let chunk_end = (chunk + chunk_bytes).min(blocks_end);
            // Safety: fresh, aligned block memory not reachable by anyone.
            unsafe {
                let head = BlockRef::write_fresh(
                    NonNull::new_unchecked(chunk as *mut Block),
                    chunk_end,
                );
                self.free_blocks.push(head.pool_link());
            }
            chunk = chunk_end;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Empty blocks
    // ------------------------------------------------------------------

    /// Take a block from the free-block pool (growing it if necessary) and
    /// initialise it for `object_size` objects owned by `owner`.
    pub(crate) fn get_empty_block(
        &self,
        object_size: usize,
        owner: u64,
        next_privatizable: usize,
    ) -> Result<BlockRef, VmError> {
        let chunk = loop {
            if let Some(link) = self.free_blocks.pop() {
                // Safety: the free-block pool only holds block headers.
                break unsafe { BlockRef::from_pool_link(link) };
            }
            self.grow()?;
        };

        // Carve from the top of the chunk so the head keeps its header.
        let top = chunk.chunk_end() - BLOCK_SIZE;
        let block = if top == chunk.addr() {
            chunk
        } else {
            chunk.set_chunk_end(top);
            // Safety: `chunk` was just popped and is still a valid header;
            // `top` lies inside the chunk and has never held a header.
            unsafe {
                self.free_blocks.push(chunk.pool_link());
                BlockRef::write_fresh(NonNull::new_unchecked(top as *mut Block), top + BLOCK_SIZE)
            }
        };
        block.init_empty(object_size, owner, next_privatizable);
        self.counters.blocks_carved.add(1);
        Ok(block)
    }

    /// Put an empty block back into the free-block pool.
    pub(crate) fn return_empty_block(&self, block: BlockRef) {
        block.reset_to_chunk();
        self.counters.blocks_returned.add(1);
        // Safety: the caller no longer references `block`.
        unsafe { self.free_blocks.push(block.pool_link()) };
    }

    // ------------------------------------------------------------------
    // Orphans
    // ------------------------------------------------------------------

    /// Leave a non-empty block for another thread to adopt.
    pub(crate) fn return_partial_block(&self, bin: &Bin, block: BlockRef, class: usize) {
        if block.next_privatizable() == bin.addr() && !block.try_mark_public_unusable() {
            // A foreign free started a wave first and is about to post the
            // block into `bin`'s mailbox. Wait for it to finish.
            let mut spins = 0u32;
            while block.next_privatizable() == bin.addr() {
                spins = spins.wrapping_add(1);
                if spins.is_multiple_of(SPINS_PER_YIELD) {
                    thread::yield_now();
                } else {
                    hint::spin_loop();
                }
            }
        }
        block.set_prev(None);
        block.set_next(None);
        block.set_owner(0);
        block.set_next_privatizable(UNUSABLE);
        self.counters.blocks_orphaned.add(1);
        // Safety: the exiting owner gives the block up here.
        unsafe { self.orphans[class].push(block.pool_link()) };
    }

    /// Adopt an orphan of `class` into `bin`, reconciling its public frees.
    pub(crate) fn get_partial_block(&self, bin: &Bin, class: usize, owner: u64) -> Option<BlockRef> {
        let link = self.orphans[class].pop()?;
        // Safety: orphan pools only hold block headers.
        let block = unsafe { BlockRef::from_pool_link(link) };
        block.set_next(None);
        block.set_prev(None);
        block.set_owner(owner);
        block.set_next_privatizable(bin.addr());
        block.privatize_public_free_list();
        if block.allocated_count() == 0 {
            block.restore_bump_ptr();
        } else {
            block.empty_enough_to_use();
        }
        self.counters.blocks_adopted.add(1);
        Some(block)
    }
}

impl Drop for BlockSupply {
    fn drop(&mut self) {
        while let Some(link) = self.regions.pop() {
            let record = link.cast::<RegionRecord>().as_ptr();
            // Safety: region records were written in `grow` and are read
            // before their region is released.
            let (base, len) = unsafe { ((*record).base, (*record).len) };
            // Safety: `base`/`len` describe a mapping made in `grow`.
            let res = unsafe { self.unmap(NonNull::new_unchecked(base as *mut u8), len) };
            debug_assert!(res.is_ok(), "region release failed");
            self.counters.os_mapped.sub(len);
        }
    }
}
