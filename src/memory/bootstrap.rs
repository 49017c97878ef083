//! Fixed-size object allocator for the allocator's own metadata.
//!
//! Thread bin arrays cannot come from the thread's own bins, so they are
//! carved from ordinary blocks owned by nobody (owner 0, `next_privatizable`
//! `UNUSABLE`) under a single mutex. Freed arrays are kept on a free list
//! and reused; bootstrap blocks are never returned to the pool.

use super::block::{BlockRef, FreeObject, UNUSABLE};
use super::supply::BlockSupply;
use super::vm::VmError;
use crate::sync::{Mutex, lock};
use std::ptr::{self, NonNull};

struct BootstrapState {
    block: Option<BlockRef>,
    free_list: *mut FreeObject,
}

// Safety: the state only holds addresses of allocator-owned memory and is
// always accessed under the mutex.
unsafe impl Send for BootstrapState {}

pub(crate) struct BootstrapAllocator {
    object_size: usize,
    state: Mutex<BootstrapState>,
}

impl BootstrapAllocator {
    pub(crate) fn new(object_size: usize) -> Self {
        debug_assert!(object_size < super::block::BLOCK_USABLE);
        Self {
            // Objects are carved from the block end; keep every one 16-aligned.
            object_size: (object_size.max(std::mem::size_of::<FreeObject>()) + 15) & !15,
            state: Mutex::new(BootstrapState {
                block: None,
                free_list: ptr::null_mut(),
            }),
        }
    }

    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    pub(crate) fn allocate(&self, supply: &BlockSupply) -> Result<NonNull<u8>, VmError> {
        let mut state = lock(&self.state);
        if let Some(head) = NonNull::new(state.free_list) {
            // Safety: free-list nodes are bootstrap objects freed via `free`.
            state.free_list = unsafe { (*head.as_ptr()).next };
            return Ok(head.cast::<u8>());
        }
        if let Some(obj) = state.block.and_then(BlockRef::allocate_from_bump) {
            return Ok(obj);
        }
        let block = supply.get_empty_block(self.object_size, 0, UNUSABLE)?;
        state.block = Some(block);
        block.allocate_from_bump().ok_or_else(|| {
            VmError::AcquireFailed(std::io::Error::other("bootstrap object larger than a block"))
        })
    }

    /// # Safety
    /// `object` must come from [`allocate`](Self::allocate) on this instance
    /// and must not be used afterwards.
    pub(crate) unsafe fn free(&self, object: NonNull<u8>) {
        let node = object.cast::<FreeObject>();
        let mut state = lock(&self.state);
        // Safety: upheld by caller.
        unsafe { (*node.as_ptr()).next = state.free_list };
        state.free_list = node.as_ptr();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_objects_are_distinct_and_unowned() {
        let supply = BlockSupply::new(1024 * 1024, 16, None);
        let boot = BootstrapAllocator::new(700);
        assert_eq!(boot.object_size(), 704);
        let a = boot.allocate(&supply).unwrap();
        let b = boot.allocate(&supply).unwrap();
        assert_ne!(a, b);
        assert!((a.as_ptr() as usize).abs_diff(b.as_ptr() as usize) >= 704);
        // Safety: Test code.
        let block = unsafe { BlockRef::containing(a) };
        assert_eq!(block.owner(), 0);
        assert_eq!(block.next_privatizable(), UNUSABLE);
    }

    #[test]
    fn test_freed_object_is_reused() {
        let supply = BlockSupply::new(1024 * 1024, 16, None);
        let boot = BootstrapAllocator::new(64);
        let a = boot.allocate(&supply).unwrap();
        // Safety: Test code.
        unsafe { boot.free(a) };
        assert_eq!(boot.allocate(&supply).unwrap(), a);
    }

    #[test]
    fn test_moves_to_a_new_block_when_full() {
        let supply = BlockSupply::new(1024 * 1024, 16, None);
        let boot = BootstrapAllocator::new(4000);
        let objs: Vec<_> = (0..10).map(|_| boot.allocate(&supply).unwrap()).collect();
        let blocks: std::collections::HashSet<_> = objs
            .iter()
            // Safety: Test code.
            .map(|&p| unsafe { BlockRef::containing(p) }.addr())
            .collect();
        assert!(blocks.len() >= 3);
        assert_eq!(supply.counters.blocks_carved.get(), blocks.len());
    }
}
