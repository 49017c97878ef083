/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the public-free protocol and its neighbours under the thread
/// interleavings loom can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - One or two objects per thread.
///   - Blocks are heap-backed and written with `write_fresh`, so their
///     header atomics are loom-tracked. Tests that need a `BlockSupply`
///     create a fresh one per iteration (`BlockSupply` maps through the
///     heap-backed `VmOps` under cfg(loom)).
///   - `LifoPool`'s 128-bit top word is not a loom atomic; pool tests only
///     cover the node links.
///   - `GlobalScalableAllocator` is NOT tested: its OnceLock static does
///     not reset between loom iterations, and the thread-local arena
///     slot is outside the model.
///   - The orphan hand-off spins while a foreign free finishes posting;
///     those tests use `preemption_bound(2)`.
#[cfg(loom)]
mod tests {
    use crate::memory::bin::{Bin, free_public_object};
    use crate::memory::block::{BLOCK_SIZE, Block, BlockRef, FreeObject};
    use crate::memory::lifo::{LifoPool, PoolLink};
    use crate::memory::size_class::classify;
    use crate::memory::supply::BlockSupply;
    use crate::sync::Arc;
    use std::ptr::NonNull;

    // =====================================================================
    // Helpers
    // =====================================================================

    /// Heap-backed, block-aligned block of `object_size` objects owned by
    /// arena 1 and bound to `bin`.
    fn alloc_fake_block(object_size: usize, bin: &Bin) -> (BlockRef, std::alloc::Layout) {
        let layout = std::alloc::Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let nn = NonNull::new(ptr.cast::<Block>()).expect("alloc failed");
        let block = unsafe { BlockRef::write_fresh(nn, ptr as usize + BLOCK_SIZE) };
        block.init_empty(object_size, 1, bin.addr());
        (block, layout)
    }

    /// 64-byte node with a loom-tracked `PoolLink` at offset 0.
    fn alloc_fake_node() -> (NonNull<PoolLink>, std::alloc::Layout) {
        let layout = std::alloc::Layout::from_size_align(64, 64).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<PoolLink>();
        let nn = NonNull::new(ptr).expect("alloc failed");
        unsafe { std::ptr::write(nn.as_ptr(), PoolLink::new()) };
        (nn, layout)
    }

    fn block_at(addr: usize) -> BlockRef {
        unsafe { BlockRef::from_raw(NonNull::new(addr as *mut Block).unwrap()) }
    }

    fn object_at(addr: usize) -> NonNull<FreeObject> {
        NonNull::new(addr as *mut FreeObject).unwrap()
    }

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. LifoPool links
    // =====================================================================

    #[test]
    fn loom_lifo_concurrent_push() {
        bounded(2).check(|| {
            let pool = Arc::new(LifoPool::new());
            let (node_a, layout_a) = alloc_fake_node();
            let (node_b, layout_b) = alloc_fake_node();
            let na = node_a.as_ptr() as usize;
            let nb = node_b.as_ptr() as usize;

            let p1 = pool.clone();
            let p2 = pool.clone();
            let t1 = loom::thread::spawn(move || unsafe {
                p1.push(NonNull::new(na as *mut PoolLink).unwrap());
            });
            let t2 = loom::thread::spawn(move || unsafe {
                p2.push(NonNull::new(nb as *mut PoolLink).unwrap());
            });
            t1.join().unwrap();
            t2.join().unwrap();

            let mut popped = Vec::new();
            while let Some(p) = pool.pop() {
                popped.push(p.as_ptr() as usize);
            }
            assert_eq!(popped.len(), 2);
            assert!(popped.contains(&na));
            assert!(popped.contains(&nb));

            unsafe {
                std::alloc::dealloc(node_a.as_ptr().cast(), layout_a);
                std::alloc::dealloc(node_b.as_ptr().cast(), layout_b);
            }
        });
    }

    // =====================================================================
    // 3. Public free vs. owner privatization
    // =====================================================================

    /// A foreign free races the owner draining its mailbox. Whichever way
    /// it falls, the object is adopted exactly once.
    #[test]
    fn loom_public_free_vs_mailbox_drain() {
        bounded(2).check(|| {
            let bin = Arc::new(Bin::new());
            let (block, layout) = alloc_fake_block(64, &bin);
            let kept = block.allocate().unwrap();
            let remote = block.allocate().unwrap().as_ptr() as usize;
            let addr = block.addr();

            let t = loom::thread::spawn(move || {
                free_public_object(block_at(addr), object_at(remote));
            });

            let early = bin.get_public_free_list_block();
            t.join().unwrap();
            let late = bin.get_public_free_list_block();

            match (early, late) {
                (Some(b), None) | (None, Some(b)) => assert_eq!(b, block),
                (e, l) => panic!("early={} late={}", e.is_some(), l.is_some()),
            }
            assert_eq!(block.allocated_count(), 1);
            assert_eq!(block.public_free_list(), 0);
            assert_eq!(block.next_privatizable(), bin.addr());

            block.free_local(kept.cast());
            assert_eq!(block.allocated_count(), 0);
            unsafe { std::alloc::dealloc(block.as_ptr().cast(), layout) };
        });
    }

    /// Two foreign frees in one wave post the block once.
    #[test]
    fn loom_two_foreign_frees_post_once() {
        bounded(2).check(|| {
            let bin = Arc::new(Bin::new());
            let (block, layout) = alloc_fake_block(64, &bin);
            let a = block.allocate().unwrap().as_ptr() as usize;
            let b = block.allocate().unwrap().as_ptr() as usize;
            let addr = block.addr();

            let t1 = loom::thread::spawn(move || free_public_object(block_at(addr), object_at(a)));
            let t2 = loom::thread::spawn(move || free_public_object(block_at(addr), object_at(b)));
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(bin.get_public_free_list_block(), Some(block));
            assert!(bin.get_public_free_list_block().is_none());
            assert_eq!(block.allocated_count(), 0);
            unsafe { std::alloc::dealloc(block.as_ptr().cast(), layout) };
        });
    }

    // =====================================================================
    // 4. Orphan hand-off vs. foreign free
    // =====================================================================

    /// The owner orphans a block while another thread frees into it. The
    /// adopter sees the foreign free whether it landed before or after the
    /// `UNUSABLE` mark.
    #[test]
    fn loom_orphan_handoff_vs_foreign_free() {
        bounded(2).check(|| {
            let supply = BlockSupply::new(4 * BLOCK_SIZE, 2, None);
            let bin = Bin::new();
            let class = classify(64);
            let block = supply.get_empty_block(64, 1, bin.addr()).unwrap();
            let _kept = block.allocate().unwrap();
            let remote = block.allocate().unwrap().as_ptr() as usize;
            let addr = block.addr();

            let t = loom::thread::spawn(move || {
                free_public_object(block_at(addr), object_at(remote));
            });

            supply.return_partial_block(&bin, block, class);
            t.join().unwrap();
            // A post that won the race left a stale mailbox entry; the
            // exiting owner discards it.
            bin.drain_mailbox();

            let adopter = Bin::new();
            let adopted = supply.get_partial_block(&adopter, class, 2).unwrap();
            assert_eq!(adopted, block);
            assert_eq!(adopted.owner(), 2);
            assert_eq!(adopted.allocated_count(), 1);
            assert_eq!(adopted.public_free_list(), 0);
            assert_eq!(adopted.next_privatizable(), adopter.addr());
        });
    }
}
