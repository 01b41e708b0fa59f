//! Loom-based concurrency models.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Loom exhaustively enumerates thread interleavings, so models stay tiny:
//! 2 threads, a handful of blocks, `QUEUE_SIZE` shrunk to 8 (see
//! `heap::ring`).  Block headers and the page map use raw-memory `std`
//! atomics that loom cannot track; these models check the protocol atomics
//! (hand-off publication, ring claims, registry insertion), which are the
//! only cross-thread edges the design relies on.

#[cfg(loom)]
mod tests {
    use crate::heap::block::BlockHeader;
    use crate::heap::handoff::{ThreadHandoff, ThreadRegistry};
    use crate::heap::recycle::RecycleBin;
    use crate::sync::Arc;
    use std::ptr::NonNull;

    const FAKE_PAGE: usize = 4096;

    /// Heap-backed fake page split into three blocks.
    fn carve_three() -> (NonNull<BlockHeader>, [NonNull<BlockHeader>; 3]) {
        let layout = std::alloc::Layout::from_size_align(FAKE_PAGE, 1024).unwrap();
        // Safety: non-zero layout; loom models own the memory exclusively.
        unsafe {
            let page = NonNull::new(std::alloc::alloc_zeroed(layout).cast::<BlockHeader>())
                .expect("alloc failed");
            page.as_ref().init_page(FAKE_PAGE);
            let b = page.as_ref().split_after(512).unwrap();
            let c = b.as_ref().split_after(512).unwrap();
            (page, [page, b, c])
        }
    }

    fn free_page(page: NonNull<BlockHeader>) {
        let layout = std::alloc::Layout::from_size_align(FAKE_PAGE, 1024).unwrap();
        // Safety: allocated in carve_three.
        unsafe { std::alloc::dealloc(page.as_ptr().cast(), layout) };
    }

    fn batch_len(mut head: *mut BlockHeader) -> usize {
        let mut n = 0;
        while !head.is_null() {
            n += 1;
            // Safety: links intact for handed-off blocks.
            head = unsafe { (*head).queue_next() };
        }
        n
    }

    #[test]
    fn loom_handoff_owner_vs_collector_loses_nothing() {
        loom::model(|| {
            let (page, blocks) = carve_three();
            let ho = Arc::new(ThreadHandoff::new());

            // raw pointers are not Send; ship addresses instead
            let addr0 = blocks[0].as_ptr() as usize;
            let addr1 = blocks[1].as_ptr() as usize;
            let owner = {
                let ho = ho.clone();
                loom::thread::spawn(move || {
                    // Safety: the model owns the blocks; the addresses are
                    // valid for the whole iteration.
                    unsafe {
                        ho.release(NonNull::new_unchecked(addr0 as *mut BlockHeader));
                        ho.release(NonNull::new_unchecked(addr1 as *mut BlockHeader));
                    }
                    ho.mark_done();
                })
            };

            // collector side: swap whatever is published
            let mut got = batch_len(ho.take_garbage());
            owner.join().unwrap();

            // owner is done: everything left must be reachable now
            got += batch_len(ho.take_garbage());
            // Safety: done was published by the joined owner.
            got += batch_len(unsafe { ho.drain_on_deck() });
            assert_eq!(got, 2, "a freed block was lost in the hand-off");

            free_page(page);
        });
    }

    #[test]
    fn loom_ring_claims_are_exclusive() {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(3);
        builder.check(|| {
            let (page, blocks) = carve_three();
            let bin = Arc::new(RecycleBin::new());

            // Safety: single "collector" (this thread) seeds and publishes.
            unsafe {
                bin.cache_block(blocks[0]);
                bin.cache_block(blocks[1]);
                assert!(bin.claim().is_none()); // demand
                bin.publish();
            }

            let t1 = {
                let bin = bin.clone();
                loom::thread::spawn(move || bin.claim().map(|h| h.as_ptr() as usize))
            };
            let t2 = {
                let bin = bin.clone();
                loom::thread::spawn(move || bin.claim().map(|h| h.as_ptr() as usize))
            };
            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            if let (Some(a), Some(b)) = (a, b) {
                assert_ne!(a, b, "two claims returned the same slot");
            }
            free_page(page);
        });
    }

    #[test]
    fn loom_registry_concurrent_register() {
        loom::model(|| {
            let reg = Arc::new(ThreadRegistry::new());

            let t1 = {
                let reg = reg.clone();
                loom::thread::spawn(move || reg.register().as_ptr() as usize)
            };
            let t2 = {
                let reg = reg.clone();
                loom::thread::spawn(move || reg.register().as_ptr() as usize)
            };
            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            // both nodes are reachable from the head
            let mut seen = Vec::new();
            let mut cur = reg.head();
            while let Some(node) = NonNull::new(cur) {
                seen.push(node.as_ptr() as usize);
                // Safety: registered nodes stay alive (never unlinked here).
                cur = unsafe { node.as_ref().next() };
            }
            assert!(seen.contains(&a));
            assert!(seen.contains(&b));
            assert_eq!(seen.len(), 2);

            // reclaim the leaked nodes so loom iterations stay clean
            // Safety: single thread again; both owners are joined.
            unsafe {
                while let Some(node) = NonNull::new(reg.head()) {
                    assert!(reg.unlink(std::ptr::null_mut(), node));
                    drop(Box::from_raw(node.as_ptr()));
                }
            }
        });
    }
}
