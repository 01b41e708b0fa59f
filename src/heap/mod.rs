pub(crate) mod block;
pub(crate) mod ring;
pub(crate) mod size_class;
pub(crate) mod page_map;
pub(crate) mod recycle;
pub(crate) mod handoff;
pub(crate) mod arena;
pub(crate) mod collector;
pub(crate) mod stats;
pub(crate) mod integration;
pub(crate) mod loom_tests;

pub mod api;
pub mod vm;

/// OS extent for variable-sized blocks.
pub const CHUNK_SIZE: usize = 256 * 1024;
/// OS extent hosting slab units.  Identical to [`CHUNK_SIZE`]; kept as a
/// separate name because the two are tuned independently.
pub(crate) const ALIGN_CHUNK_SIZE: usize = CHUNK_SIZE;

/// Largest request served from slabs.
pub const SMALL_BLOCK: usize = 336;
/// Requests with `size + HEADER_SIZE >= LARGE_BLOCK` bypass the tiers and map
/// their own pages.
pub const LARGE_BLOCK: usize = CHUNK_SIZE;

/// Smallest request; anything below is rounded up.
pub(crate) const MIN_BLOCK_SIZE: usize = 8;

/// Blocks fetched per batch when refilling a second-level (list) cache.
pub(crate) const LIST_CACHE_NUM: usize = 4;

/// The body length lives in a 28-bit signed field; nothing larger is
/// representable.
pub(crate) const MAX_BLOCK_BODY: usize = (1 << 27) - 1;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
