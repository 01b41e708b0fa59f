use super::arena::ThreadArena;
use super::collector::{self, CollectorShared};
use super::stats;
use crate::sync::atomic::Ordering;
use crate::sync::cell::UnsafeCell;
use crate::sync::{Arc, OnceLock};
use std::ptr::NonNull;

/// Snapshot of the process-wide allocator gauges.
///
/// Counters are global: with more than one [`Heap`] alive they aggregate over
/// all of them.  Diagnostic display only.
pub struct HeapStats {
    pub mapped_bytes: usize,
    pub unmapped_bytes: usize,
    pub live_pages: usize,
    pub collector_passes: usize,
    pub blocks_published: usize,
}

/// An allocator instance: the shared tier state plus its collector thread.
///
/// The process-wide [`allocate`]/[`deallocate`] surface lazily creates one
/// global `Heap`; separate instances exist for tests and embedding.
pub struct Heap {
    shared: Arc<CollectorShared>,
    collector: Option<crate::sync::thread::JoinHandle<()>>,
}

impl Heap {
    /// Create the tier state and start the collector thread.
    pub fn new() -> Self {
        let shared = Arc::new(CollectorShared::new());
        let worker = shared.clone();
        let collector = crate::sync::thread::spawn(move || collector::run(&worker));
        Self {
            shared,
            collector: Some(collector),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<CollectorShared> {
        &self.shared
    }

    /// Build a mutator arena bound to this heap.  Used by tests and by
    /// embedders that manage their own thread-locals.
    pub(crate) fn new_arena(&self) -> ThreadArena {
        ThreadArena::new(self.shared.clone())
    }

    /// Signal the collector, join it, and return every fully coalesced page
    /// to the OS.  Pages still holding live user blocks stay mapped.
    /// In-flight mutator operations complete on their own; frees issued after
    /// shutdown park in the hand-offs and are only swept by a later drop of
    /// their pages' last blocks.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.collector.take() {
            self.shared.shutdown.store(true, Ordering::Release);
            drop(handle.join());
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            mapped_bytes: stats::TOTAL_MAPPED.get(),
            unmapped_bytes: stats::TOTAL_UNMAPPED.get(),
            live_pages: stats::LIVE_PAGES.get(),
            collector_passes: stats::COLLECTOR_PASSES.get(),
            blocks_published: stats::BLOCKS_PUBLISHED.get(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static GLOBAL_HEAP: OnceLock<Heap> = OnceLock::new();

fn global() -> &'static Heap {
    GLOBAL_HEAP.get_or_init(Heap::new)
}

thread_local! {
    static THREAD_ARENA: ArenaHandle = ArenaHandle::new();
}

/// Per-thread handle owning the thread's arena for the global heap.
///
/// The arena is built lazily on the thread's first touch and drained back to
/// the collector when the thread exits (the `Drop` of the inner
/// [`ThreadArena`]).  `UnsafeCell` is sound here because only the owning
/// thread reaches the handle, and neither `alloc` nor `free` re-enters TLS.
struct ArenaHandle {
    arena: UnsafeCell<Option<ThreadArena>>,
}

impl ArenaHandle {
    fn new() -> Self {
        Self {
            arena: UnsafeCell::new(None),
        }
    }
}

fn with_arena<R>(f: impl FnOnce(&mut ThreadArena) -> R) -> R {
    let heap = global();
    THREAD_ARENA.with(|handle| {
        // Safety: single-threaded TLS access (see ArenaHandle).
        let slot = crate::sync::unsafe_cell_get_mut!(handle.arena);
        let arena = slot.get_or_insert_with(|| heap.new_arena());
        f(arena)
    })
}

/// Allocate `size` usable bytes from the calling thread's arena.
///
/// Returns an 8-byte-aligned pointer whose body holds at least `size` bytes.
/// Null is returned when `size == 0`, when `size` exceeds the largest
/// representable body (`2^27 - 1` bytes, the limit of the block header's
/// size field), or when the OS refused a mapping.
pub fn allocate(size: usize) -> *mut u8 {
    with_arena(|arena| arena.alloc(size)).map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Free a pointer previously returned by [`allocate`].  Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer obtained from [`allocate`] that has not
/// been freed already.
pub unsafe fn deallocate(ptr: *mut u8) {
    let Some(p) = NonNull::new(ptr) else { return };
    // Safety: forwarded caller contract.
    with_arena(|arena| unsafe { arena.free(p) });
}
