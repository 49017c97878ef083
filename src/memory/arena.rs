//! Per-thread bins and the allocation entry points.
//!
//! A `ThreadArena` is bound to the thread that created it (it is neither
//! `Send` nor `Sync`). Any thread may free memory that another arena
//! allocated; such frees take the public path into the owning block.

use super::bin::{Bin, free_public_object};
use super::block::{BLOCK_SIZE, BlockRef, FreeObject, MALLOC_UNIQUE_ID};
use super::large::{
    allocate_large, free_large, is_large_object, large_capacity, large_object_size,
    set_large_object_size,
};
use super::scalable::{AllocError, ScalableAllocator};
use super::size_class::{
    FITTING_ALIGNMENT, MAX_SEGREGATED_OBJECT_SIZE, MIN_LARGE_OBJECT_SIZE, NUM_BINS, align_up,
    classify, object_size,
};
use std::ptr::{self, NonNull};

pub struct ThreadArena<'a> {
    allocator: &'a ScalableAllocator,
    bins: NonNull<Bin>,
    id: u64,
}

impl<'a> ThreadArena<'a> {
    pub(crate) fn new(allocator: &'a ScalableAllocator) -> Result<Self, AllocError> {
        let bootstrap = allocator.bootstrap();
        let raw = bootstrap
            .allocate(allocator.supply())
            .map_err(|e| AllocError::from_vm(bootstrap.object_size(), e))?;
        let bins = raw.cast::<Bin>();
        for i in 0..NUM_BINS {
            // Safety: the bootstrap object holds `NUM_BINS` bins and is
            // 16-byte aligned.
            unsafe { bins.as_ptr().add(i).write(Bin::new()) };
        }
        allocator.supply().counters.arenas_live.add(1);
        Ok(Self {
            allocator,
            bins,
            id: allocator.next_arena_id(),
        })
    }

    /// Owner tag written into blocks this arena allocates from.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn bin(&self, class: usize) -> &Bin {
        debug_assert!(class < NUM_BINS);
        // Safety: `bins` holds NUM_BINS initialised bins until `drop`.
        unsafe { &*self.bins.as_ptr().add(class) }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes (at least one word for `size == 0`).
    ///
    /// # Errors
    ///
    /// Returns `AllocError::OutOfMemory` when neither the thread's blocks,
    /// orphans, the free-block pool nor the OS can serve the request.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = if size == 0 { size_of::<usize>() } else { size };
        if size >= MIN_LARGE_OBJECT_SIZE {
            return self.allocate_large(size, BLOCK_SIZE);
        }
        self.allocate_small(size)
    }

    fn allocate_large(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        match allocate_large(self.allocator.supply(), size, alignment) {
            Ok(Some(ptr)) => Ok(ptr),
            Ok(None) => Err(AllocError::SizeOverflow),
            Err(e) => Err(AllocError::from_vm(size, e)),
        }
    }

    fn allocate_small(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = classify(size);
        let bin = self.bin(class);
        let supply = self.allocator.supply();

        loop {
            let mut current = bin.active();
            while let Some(block) = current {
                if let Some(obj) = block.allocate() {
                    return Ok(obj);
                }
                current = bin.set_previous_block_active();
            }

            let Some(block) = bin.get_public_free_list_block() else {
                break;
            };
            if block.empty_enough_to_use() {
                bin.move_block_to_front(block);
            }
            if let Some(obj) = block.allocate_from_free_list() {
                return Ok(obj);
            }
            // The posted wave was already consumed; start over.
        }

        while let Some(block) = supply.get_partial_block(bin, class, self.id) {
            bin.push_into_bin(block);
            bin.set_active(Some(block));
            if let Some(obj) = block.allocate() {
                return Ok(obj);
            }
        }

        let block = supply
            .get_empty_block(object_size(size), self.id, bin.addr())
            .map_err(|e| AllocError::from_vm(size, e))?;
        bin.push_into_bin(block);
        bin.set_active(Some(block));
        block.allocate().ok_or(AllocError::OutOfMemory { size })
    }

    /// Allocate zero-filled memory for `count` elements of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::SizeOverflow` if `count * size` overflows,
    /// otherwise as [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let ptr = self.allocate(total)?;
        // Large objects come straight from a fresh mapping.
        if total < MIN_LARGE_OBJECT_SIZE {
            // Safety: `ptr` has room for `total` bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        }
        Ok(ptr)
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidAlignment` if `alignment` is not a power
    /// of two, otherwise as [`allocate`](Self::allocate).
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        let ptr = if size <= MAX_SEGREGATED_OBJECT_SIZE && alignment <= MAX_SEGREGATED_OBJECT_SIZE {
            // A class whose size is a multiple of `alignment` only holds
            // `alignment`-aligned objects.
            self.allocate(align_up(size.max(size_of::<usize>()), alignment))?
        } else if alignment <= FITTING_ALIGNMENT {
            self.allocate(size)?
        } else if size
            .checked_add(alignment)
            .is_some_and(|padded| padded < MIN_LARGE_OBJECT_SIZE)
        {
            // Over-allocate a fitting object and hand out an interior
            // pointer; `free` finds the object start from the block end.
            let unaligned = self.allocate(size + alignment)?;
            let aligned = align_up(unaligned.as_ptr() as usize, alignment);
            // Safety: `aligned + size` stays within the object.
            unsafe { NonNull::new_unchecked(aligned as *mut u8) }
        } else {
            // Alignment above the block size marks the pointer as large.
            self.allocate_large(size, alignment.max(BLOCK_SIZE))?
        };
        debug_assert!((ptr.as_ptr() as usize).is_multiple_of(alignment));
        Ok(ptr)
    }

    /// `posix_memalign` contract: `alignment` must be a power of two and a
    /// multiple of the pointer size. [`AllocError::errno`] gives the matching
    /// return code.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidAlignment` for a rejected alignment,
    /// otherwise as [`allocate_aligned`](Self::allocate_aligned).
    pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if !alignment.is_power_of_two() || !alignment.is_multiple_of(size_of::<usize>()) {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        self.allocate_aligned(size, alignment)
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    /// Free memory from any arena of the same allocator. `None` is a no-op.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and must not be used afterwards.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        if is_large_object(ptr) {
            // Safety: upheld by caller.
            unsafe { free_large(self.allocator.supply(), ptr) };
            return;
        }

        // Safety: upheld by caller.
        let block = unsafe { BlockRef::containing(ptr) };
        debug_assert_eq!(block.unique_id(), MALLOC_UNIQUE_ID, "foreign pointer freed");
        let object = if block.object_size() <= MAX_SEGREGATED_OBJECT_SIZE {
            ptr.cast::<FreeObject>()
        } else {
            // Aligned allocations may hand out interior pointers.
            block.find_allocated_object(ptr)
        };
        debug_assert!(block.is_properly_placed(object));

        if block.owner() == self.id {
            self.free_local(block, object);
        } else {
            free_public_object(block, object);
        }
    }

    fn free_local(&self, block: BlockRef, object: NonNull<FreeObject>) {
        block.free_local(object);
        let bin = self.bin(classify(block.object_size()));
        if block.is_full() {
            if block.empty_enough_to_use() {
                bin.move_block_to_front(block);
            }
        } else if block.allocated_count() == 0 && block.public_free_list() == 0 {
            self.process_less_used_block(bin, block);
        }
    }

    /// An unused block goes back to the pool unless it is one of the two
    /// blocks allocation tries first; those just restart their bump pointer.
    fn process_less_used_block(&self, bin: &Bin, block: BlockRef) {
        let active = bin.active();
        if active != Some(block) && active.and_then(BlockRef::prev) != Some(block) {
            bin.remove_from_bin(block);
            self.allocator.supply().return_empty_block(block);
        } else {
            block.restore_bump_ptr();
        }
    }

    // ------------------------------------------------------------------
    // Reallocation
    // ------------------------------------------------------------------

    /// Resize an allocation, moving it if it does not fit in place.
    ///
    /// `None` behaves as [`allocate`](Self::allocate); `size == 0` frees
    /// and returns `None`.
    ///
    /// # Errors
    ///
    /// On error the original allocation is left untouched.
    ///
    /// # Safety
    /// As [`free`](Self::free).
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(size).map(Some);
        };
        if size == 0 {
            // Safety: upheld by caller.
            unsafe { self.free(Some(ptr)) };
            return Ok(None);
        }
        // Safety: upheld by caller.
        unsafe { self.reallocate_in(ptr, size, None) }.map(Some)
    }

    /// As [`reallocate`](Self::reallocate), keeping `alignment`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidAlignment` if `alignment` is not a power
    /// of two; the original allocation is left untouched on any error.
    ///
    /// # Safety
    /// As [`free`](Self::free).
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        let Some(ptr) = ptr else {
            return self.allocate_aligned(size, alignment).map(Some);
        };
        if size == 0 {
            // Safety: upheld by caller.
            unsafe { self.free(Some(ptr)) };
            return Ok(None);
        }
        // Safety: upheld by caller.
        unsafe { self.reallocate_in(ptr, size, Some(alignment)) }.map(Some)
    }

    unsafe fn reallocate_in(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        alignment: Option<usize>,
    ) -> Result<NonNull<u8>, AllocError> {
        let keeps_alignment =
            alignment.is_none_or(|align| (ptr.as_ptr() as usize).is_multiple_of(align));
        let copy_size = if is_large_object(ptr) {
            // Safety: `ptr` is a live large object.
            unsafe {
                if size <= large_capacity(ptr) && keeps_alignment {
                    set_large_object_size(ptr, size);
                    return Ok(ptr);
                }
                large_object_size(ptr)
            }
        } else {
            // Safety: `ptr` is a live block object.
            let capacity = unsafe { BlockRef::containing(ptr) }.capacity_from(ptr);
            if size <= capacity && keeps_alignment {
                return Ok(ptr);
            }
            capacity
        };

        let new = match alignment {
            Some(align) => self.allocate_aligned(size, align)?,
            None => self.allocate(size)?,
        };
        // Safety: both regions hold at least `min(copy_size, size)` bytes and
        // belong to different live allocations.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), copy_size.min(size));
            self.free(Some(ptr));
        }
        Ok(new)
    }

    /// Bytes usable from `ptr` to the end of its object or mapping.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        if is_large_object(ptr) {
            // Safety: upheld by caller.
            unsafe { large_capacity(ptr) }
        } else {
            // Safety: upheld by caller.
            unsafe { BlockRef::containing(ptr) }.capacity_from(ptr)
        }
    }

    // ------------------------------------------------------------------
    // Checked variants
    // ------------------------------------------------------------------

    /// Free `ptr` if this allocator produced it, otherwise hand it to
    /// `fallback`.
    ///
    /// # Safety
    /// As [`ScalableAllocator::is_owned_by_this_allocator`]; pointers that
    /// pass the check must satisfy [`free`](Self::free).
    pub unsafe fn safer_free(&self, ptr: Option<NonNull<u8>>, fallback: impl FnOnce(NonNull<u8>)) {
        let Some(ptr) = ptr else {
            return;
        };
        // Safety: upheld by caller.
        if unsafe { self.allocator.is_owned_by_this_allocator(ptr) } {
            // Safety: upheld by caller.
            unsafe { self.free(Some(ptr)) };
        } else {
            fallback(ptr);
        }
    }

    /// Reallocate `ptr` if this allocator produced it, otherwise return what
    /// `fallback` returns.
    ///
    /// # Errors
    ///
    /// As [`reallocate`](Self::reallocate) for owned pointers.
    ///
    /// # Safety
    /// As [`safer_free`](Self::safer_free).
    pub unsafe fn safer_reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        fallback: impl FnOnce(NonNull<u8>, usize) -> Option<NonNull<u8>>,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(size).map(Some);
        };
        // Safety: upheld by caller.
        if unsafe { self.allocator.is_owned_by_this_allocator(ptr) } {
            // Safety: upheld by caller.
            unsafe { self.reallocate(Some(ptr), size) }
        } else {
            Ok(fallback(ptr, size))
        }
    }

    // ------------------------------------------------------------------
    // Thread exit
    // ------------------------------------------------------------------

    /// Hand every block back and release the bins. Same as dropping.
    pub fn exit(self) {
        drop(self);
    }

    fn release_block(&self, bin: &Bin, block: BlockRef, class: usize) {
        let supply = self.allocator.supply();
        if block.allocated_count() == 0 && block.public_free_list() == 0 {
            supply.return_empty_block(block);
        } else {
            supply.return_partial_block(bin, block, class);
        }
    }
}

impl Drop for ThreadArena<'_> {
    fn drop(&mut self) {
        for class in 0..NUM_BINS {
            let bin = self.bin(class);
            let Some(active) = bin.active() else {
                continue;
            };
            let mut current = active.prev();
            while let Some(block) = current {
                current = block.prev();
                self.release_block(bin, block, class);
            }
            let mut current = Some(active);
            while let Some(block) = current {
                current = block.next();
                self.release_block(bin, block, class);
            }
            bin.set_active(None);
        }
        // A foreign thread may still be unlocking a mailbox it just posted to.
        for class in 0..NUM_BINS {
            self.bin(class).drain_mailbox();
        }
        // Safety: the bins are initialised and no block refers to them any
        // more; the array came from this allocator's bootstrap allocator.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.bins.as_ptr(), NUM_BINS));
            self.allocator.bootstrap().free(self.bins.cast::<u8>());
        }
        self.allocator.supply().counters.arenas_live.sub(1);
    }
}
