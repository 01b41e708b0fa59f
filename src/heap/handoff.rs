use super::block::{BlockHeader, BlockList};
use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::unsafe_cell_get_mut;
use std::ptr::NonNull;

/// Per-thread lock-free hand-off of freed blocks to the collector.
///
/// The owner thread accumulates frees on `on_deck` (a list threaded through
/// the freed blocks themselves) and publishes the whole batch into `at_bat`
/// whenever the collector has taken the previous one.  The collector's only
/// operation is an atomic swap of `at_bat`.
///
/// The node doubles as the thread's entry in the collector's registry: `next`
/// links the CAS-inserted thread list, and `done` tells the collector the
/// owning thread is gone and the node can be drained and freed.
#[repr(C)]
pub(crate) struct ThreadHandoff {
    /// Where the collector pulls from.
    at_bat: AtomicPtr<BlockHeader>,
    /// The collector and the owner must not false-share these fields.
    _pad1: [u64; 7],
    /// Where the owner saves frees while waiting on the collector to bat.
    on_deck: UnsafeCell<BlockList>,
    _pad2: [u64; 7],
    /// Set by the owner on thread exit, after its final releases.
    done: AtomicBool,
    /// Registry link; CAS-inserted at the head, unlinked only by the
    /// collector.
    next: AtomicPtr<ThreadHandoff>,
}

// Safety: at_bat/done/next are atomics; on_deck is owner-thread-only until
// `done` is published, after which only the collector touches it.
unsafe impl Send for ThreadHandoff {}
unsafe impl Sync for ThreadHandoff {}

impl ThreadHandoff {
    pub fn new() -> Self {
        Self {
            at_bat: AtomicPtr::new(std::ptr::null_mut()),
            _pad1: [0; 7],
            on_deck: UnsafeCell::new(BlockList::new()),
            _pad2: [0; 7],
            done: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Owner-thread free path: park the block on deck, and if the collector
    /// has consumed the previous batch, publish the deck in one store.
    ///
    /// # Safety
    /// Owner thread only.  `h` must be a free block with intact body space
    /// for list links, not reachable from anywhere else.
    pub unsafe fn release(&self, h: NonNull<BlockHeader>) {
        let deck = unsafe_cell_get_mut!(self.on_deck);
        // Safety: forwarded contract.
        unsafe { deck.push(h) };
        if self.at_bat.load(Ordering::Acquire).is_null() {
            let batch = deck.take_head();
            self.at_bat.store(batch, Ordering::Release);
        }
    }

    /// Collector: take the published batch, if any.  The returned blocks are
    /// linked through their embedded queue nodes.
    pub fn take_garbage(&self) -> *mut BlockHeader {
        self.at_bat.swap(std::ptr::null_mut(), Ordering::Acquire)
    }

    /// Collector: drain whatever is still on deck of a finished thread.
    ///
    /// # Safety
    /// Only after [`is_done`](Self::is_done) returned true — the owner no
    /// longer touches the node.
    pub unsafe fn drain_on_deck(&self) -> *mut BlockHeader {
        let deck = unsafe_cell_get_mut!(self.on_deck);
        deck.take_head()
    }

    /// Owner thread, once, after its final [`release`](Self::release) calls.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn next(&self) -> *mut ThreadHandoff {
        self.next.load(Ordering::Acquire)
    }
}

/// The collector's list of live thread hand-offs.  Threads CAS-insert at the
/// head on registration; only the collector traverses and unlinks.
pub(crate) struct ThreadRegistry {
    head: AtomicPtr<ThreadHandoff>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Register the calling thread.  The returned node stays valid until the
    /// collector observes `done` and reclaims it.
    pub fn register(&self) -> NonNull<ThreadHandoff> {
        let node = Box::into_raw(Box::new(ThreadHandoff::new()));
        let mut stale = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: node is freshly allocated and not yet published.
            unsafe { (*node).next.store(stale, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(stale, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(head) => stale = head,
            }
        }
        // Safety: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(node) }
    }

    pub fn head(&self) -> *mut ThreadHandoff {
        self.head.load(Ordering::Acquire)
    }

    /// Unlink `node` given its predecessor (`null` for the head).  Returns
    /// false if a concurrent registration got in front of a head unlink; the
    /// caller simply retries on a later pass.
    ///
    /// # Safety
    /// Collector thread only; `prev` must be `node`'s current predecessor.
    pub unsafe fn unlink(
        &self,
        prev: *mut ThreadHandoff,
        node: NonNull<ThreadHandoff>,
    ) -> bool {
        // Safety: node is still linked, so reading its next is fine.
        let after = unsafe { node.as_ref().next() };
        if prev.is_null() {
            self.head
                .compare_exchange(node.as_ptr(), after, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            // Interior links are only ever rewritten by the collector itself.
            // Safety: prev is linked per the caller contract.
            unsafe { (*prev).next.store(after, Ordering::Release) };
            true
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const ARENA: usize = 4096;

    fn carve(n: usize) -> (NonNull<BlockHeader>, Vec<NonNull<BlockHeader>>) {
        let layout = Layout::from_size_align(ARENA, 1024).unwrap();
        // Safety: test code.
        unsafe {
            let page =
                NonNull::new(alloc_zeroed(layout).cast::<BlockHeader>()).expect("alloc failed");
            page.as_ref().init_page(ARENA);
            let mut out = Vec::with_capacity(n);
            let mut cur = page;
            for _ in 0..n - 1 {
                let rest = cur.as_ref().split_after(24).expect("arena too small");
                out.push(cur);
                cur = rest;
            }
            out.push(cur);
            (page, out)
        }
    }

    fn free_arena(page: NonNull<BlockHeader>) {
        let layout = Layout::from_size_align(ARENA, 1024).unwrap();
        // Safety: allocated in carve.
        unsafe { dealloc(page.as_ptr().cast(), layout) };
    }

    fn collect_batch(mut head: *mut BlockHeader) -> Vec<*mut BlockHeader> {
        let mut out = Vec::new();
        while !head.is_null() {
            out.push(head);
            // Safety: list links intact.
            head = unsafe { (*head).queue_next() };
        }
        out
    }

    #[test]
    fn test_first_release_publishes_immediately() {
        let ho = ThreadHandoff::new();
        let (page, blocks) = carve(1);
        // Safety: test code.
        unsafe { ho.release(blocks[0]) };
        let batch = collect_batch(ho.take_garbage());
        assert_eq!(batch, vec![blocks[0].as_ptr()]);
        assert!(ho.take_garbage().is_null());
        free_arena(page);
    }

    #[test]
    fn test_batches_accumulate_while_collector_is_away() {
        let ho = ThreadHandoff::new();
        let (page, blocks) = carve(4);
        // Safety: test code.
        unsafe {
            ho.release(blocks[0]); // published
            ho.release(blocks[1]); // parked on deck
            ho.release(blocks[2]); // parked on deck
        }
        let first = collect_batch(ho.take_garbage());
        assert_eq!(first, vec![blocks[0].as_ptr()]);

        // the next release finds at_bat empty and publishes the whole deck
        // Safety: test code.
        unsafe { ho.release(blocks[3]) };
        let second = collect_batch(ho.take_garbage());
        assert_eq!(second.len(), 3);
        assert!(second.contains(&blocks[1].as_ptr()));
        assert!(second.contains(&blocks[2].as_ptr()));
        assert!(second.contains(&blocks[3].as_ptr()));
        free_arena(page);
    }

    #[test]
    fn test_done_drains_the_deck() {
        let ho = ThreadHandoff::new();
        let (page, blocks) = carve(3);
        // Safety: test code.
        unsafe {
            ho.release(blocks[0]);
            ho.release(blocks[1]);
            ho.release(blocks[2]);
        }
        ho.mark_done();
        assert!(ho.is_done());
        assert_eq!(collect_batch(ho.take_garbage()).len(), 1);
        // Safety: owner marked done.
        let rest = collect_batch(unsafe { ho.drain_on_deck() });
        assert_eq!(rest.len(), 2);
        free_arena(page);
    }

    #[test]
    fn test_registry_insert_is_lifo() {
        let reg = ThreadRegistry::new();
        let a = reg.register();
        let b = reg.register();
        let c = reg.register();
        assert_eq!(reg.head(), c.as_ptr());
        // Safety: nodes are linked.
        unsafe {
            assert_eq!(c.as_ref().next(), b.as_ptr());
            assert_eq!(b.as_ref().next(), a.as_ptr());
            assert!(a.as_ref().next().is_null());
            drop(Box::from_raw(a.as_ptr()));
            drop(Box::from_raw(b.as_ptr()));
            drop(Box::from_raw(c.as_ptr()));
        }
    }

    #[test]
    fn test_registry_unlink_interior_and_head() {
        let reg = ThreadRegistry::new();
        let a = reg.register();
        let b = reg.register();
        let c = reg.register();
        // Safety: collector discipline is trivially met in a 1-thread test.
        unsafe {
            // interior: c -> b -> a, drop b
            assert!(reg.unlink(c.as_ptr(), b));
            assert_eq!(c.as_ref().next(), a.as_ptr());
            drop(Box::from_raw(b.as_ptr()));

            // head: drop c
            assert!(reg.unlink(std::ptr::null_mut(), c));
            assert_eq!(reg.head(), a.as_ptr());
            drop(Box::from_raw(c.as_ptr()));

            assert!(reg.unlink(std::ptr::null_mut(), a));
            assert!(reg.head().is_null());
            drop(Box::from_raw(a.as_ptr()));
        }
    }
}
