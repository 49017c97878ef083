//! Per-thread, per-size-class block list and its mailbox.
//!
//! The list is owner-only. The mailbox is the one piece of a bin that other
//! threads touch: when a foreign free makes a block's public free list go
//! from NULL to non-NULL, the freeing thread links that block into the
//! owning bin's mailbox so the owner can find it without scanning.

use super::block::{BlockRef, FreeObject, UNUSABLE};
use crate::sync::cell::Cell;
use crate::sync::{Mutex, lock};
use std::ptr::NonNull;

/// Head of the chain of blocks with pending public frees. The chain is
/// threaded through each block's `next_privatizable`; 0 ends it.
struct Mailbox {
    head: usize,
}

pub(crate) struct Bin {
    active: Cell<Option<BlockRef>>,
    mailbox: Mutex<Mailbox>,
}

// Safety: `active` is only used by the owning thread; other threads reach a
// bin through a block's `next_privatizable` and only ever lock `mailbox`.
unsafe impl Sync for Bin {}
// Safety: a bin holds block addresses, never thread-affine data.
unsafe impl Send for Bin {}

impl Bin {
    pub(crate) fn new() -> Self {
        Self {
            active: Cell::new(None),
            mailbox: Mutex::new(Mailbox { head: 0 }),
        }
    }

    /// Address stored in `next_privatizable` of blocks owned through this bin.
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    #[inline]
    pub(crate) fn active(&self) -> Option<BlockRef> {
        self.active.get()
    }

    #[inline]
    pub(crate) fn set_active(&self, block: Option<BlockRef>) {
        self.active.set(block);
    }

    /// Link `block` directly behind the active block, so it is the next one
    /// tried. It becomes active only when the bin is empty.
    pub(crate) fn push_into_bin(&self, block: BlockRef) {
        match self.active() {
            Some(active) => {
                let prev = active.prev();
                block.set_next(Some(active));
                block.set_prev(prev);
                active.set_prev(Some(block));
                if let Some(prev) = prev {
                    prev.set_next(Some(block));
                }
            }
            None => {
                block.set_next(None);
                block.set_prev(None);
                self.set_active(Some(block));
            }
        }
    }

    /// Unlink `block`. If it is active, activity moves to `prev`, else `next`.
    pub(crate) fn remove_from_bin(&self, block: BlockRef) {
        let (prev, next) = (block.prev(), block.next());
        if self.active() == Some(block) {
            self.set_active(prev.or(next));
        }
        if let Some(prev) = prev {
            prev.set_next(next);
        }
        if let Some(next) = next {
            next.set_prev(prev);
        }
        block.set_next(None);
        block.set_prev(None);
    }

    /// Move one hop back from the active block. Returns the new active block.
    pub(crate) fn set_previous_block_active(&self) -> Option<BlockRef> {
        let prev = self.active().and_then(BlockRef::prev);
        if prev.is_some() {
            self.set_active(prev);
        }
        prev
    }

    /// Make `block` the next one tried after the active block.
    pub(crate) fn move_block_to_front(&self, block: BlockRef) {
        if self.active() == Some(block) {
            return;
        }
        self.remove_from_bin(block);
        self.push_into_bin(block);
    }

    /// Take one block from the mailbox and adopt its public frees.
    pub(crate) fn get_public_free_list_block(&self) -> Option<BlockRef> {
        let block = {
            let mut mailbox = lock(&self.mailbox);
            let head = NonNull::new(mailbox.head as *mut _)?;
            // Safety: only block headers are linked into a mailbox.
            let block = unsafe { BlockRef::from_raw(head) };
            mailbox.head = block.next_privatizable();
            block.set_next_privatizable(self.addr());
            block
        };
        block.privatize_public_free_list();
        Some(block)
    }

    /// Link `block` into this bin's mailbox. Called by the foreign thread
    /// whose free started a new public wave.
    fn post(&self, block: BlockRef) {
        let mut mailbox = lock(&self.mailbox);
        block.set_next_privatizable(mailbox.head);
        mailbox.head = block.addr();
    }

    /// First block waiting in the mailbox, or 0.
    #[cfg(test)]
    pub(crate) fn mailbox_head(&self) -> usize {
        lock(&self.mailbox).head
    }

    /// Wait until no foreign thread is still inside [`post`](Self::post).
    /// Called by the exiting owner before the bin memory is reused.
    pub(crate) fn drain_mailbox(&self) {
        lock(&self.mailbox).head = 0;
    }
}

/// Free `object` into a block owned by another thread (or by nobody).
pub(crate) fn free_public_object(block: BlockRef, object: NonNull<FreeObject>) {
    if !block.push_public(object) {
        return;
    }
    // First free of a wave. NULL -> non-NULL can only happen while the block
    // is owned (orphans always carry a non-NULL list), so a non-UNUSABLE
    // `next_privatizable` is the owning bin.
    let owner_bin = block.next_privatizable();
    if owner_bin == UNUSABLE {
        return;
    }
    debug_assert!(owner_bin != 0);
    // Safety: the owner cannot tear the bin down until `next_privatizable`
    // moves off it, which only `post` does here, and it drains the mailbox
    // lock before reusing the memory.
    let bin = unsafe { &*(owner_bin as *const Bin) };
    bin.post(block);
}
