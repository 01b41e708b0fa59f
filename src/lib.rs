//! gcmalloc: a thread-caching allocator with asynchronous reclamation.
//!
//! Three tiers:
//! - Per-thread arenas (front caches + slab carving, no locks)
//! - Global recycle bins (bounded single-producer / multi-consumer rings)
//! - One collector thread (drains per-thread free queues, coalesces
//!   neighbouring free blocks, refills the rings)
//!
//! A mutator allocation is at most one atomic `fetch_add` against a ring; a
//! free is a pointer push onto a thread-private list plus one conditional
//! atomic store.  Freed memory becomes globally reusable only after the
//! collector has processed it.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("gcmalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// entry points and the heap instance
pub use heap::api::{Heap, HeapStats, allocate, deallocate};

// geometry
pub use heap::{CHUNK_SIZE, LARGE_BLOCK, SMALL_BLOCK};

// errors
pub use heap::vm::VmError;
