// Slab descriptors are overlaid on raw mapped META memory, so this module
// uses `std::sync::atomic` types directly: loom's atomics are not
// layout-compatible with raw bytes (see the note in `crate::sync`).
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Slab units are 1 KiB: the low 10 bits of any cell address locate it inside
/// its slab, and `addr >> 10` keys the page map.
pub(crate) const SMALL_BIN_BITS: usize = 10;
pub(crate) const SMALL_BIN_CAPACITY: usize = 1 << SMALL_BIN_BITS;
/// Slab body length (unit minus the block header).
pub(crate) const SMALL_BIN_SIZE: usize = SMALL_BIN_CAPACITY - super::block::HEADER_SIZE;

const POINTER_BITS: usize = 48;
pub(crate) const KLEAF_BITS: usize = 15;
pub(crate) const KLEAF_LENGTH: usize = 1 << KLEAF_BITS;
pub(crate) const KROOT_BITS: usize = POINTER_BITS - SMALL_BIN_BITS - KLEAF_BITS;
pub(crate) const KROOT_LENGTH: usize = 1 << KROOT_BITS;

/// Bytes of META memory backing one leaf.
pub(crate) const LEAF_SIZE: usize = std::mem::size_of::<SlabInfo>() * KLEAF_LENGTH;
/// Leaves carved per META chunk.
pub(crate) const LEAF_ALLOC_NUM: usize = 20;
pub(crate) const META_CHUNK_SIZE: usize = LEAF_SIZE * LEAF_ALLOC_NUM;

/// Per-slab descriptor: the cell size of the hosted class and a 64-bit
/// occupancy bitmap (bit `p` set means cell `p` is live, counted from the
/// most significant bit).
///
/// The bitmap is atomic because any thread may free a cell; the allocating
/// side is always the slab's owning arena.
#[repr(C)]
pub(crate) struct SlabInfo {
    cell_size: AtomicU32,
    bitmap: AtomicU64,
}

impl SlabInfo {
    #[inline]
    pub fn cell_size(&self) -> u32 {
        self.cell_size.load(Ordering::Acquire)
    }

    /// Number of cells a slab of this class holds.
    #[inline]
    pub fn capacity_for(cell: u32) -> u32 {
        (SMALL_BIN_SIZE as u32 / cell).min(64)
    }

    /// Bind this descriptor to a freshly adopted slab.
    pub fn install(&self, cell: u32) {
        self.bitmap.store(0, Ordering::Relaxed);
        self.cell_size.store(cell, Ordering::Release);
    }

    /// Detach the descriptor; the address range is no longer a slab.
    pub fn clear(&self) {
        self.cell_size.store(0, Ordering::Release);
        self.bitmap.store(0, Ordering::Relaxed);
    }

    /// Claim the first free cell.  Returns the cell index and whether the
    /// slab just became full.  Only the owning arena allocates from a slab,
    /// so a load + `fetch_or` cannot race another setter of the same bit.
    pub fn acquire_cell(&self, capacity: u32) -> Option<(u64, bool)> {
        let word = self.bitmap.load(Ordering::Relaxed);
        let pos = (!word).leading_zeros() as u64;
        if pos >= u64::from(capacity) {
            return None;
        }
        let bit = 1u64 << (63 - pos);
        let prev = self.bitmap.fetch_or(bit, Ordering::AcqRel);
        let now = prev | bit;
        Some((pos, now.count_ones() == capacity))
    }

    /// Release cell `pos`.  Returns true when this free emptied the slab;
    /// exactly one thread observes that transition.
    pub fn release_cell(&self, pos: u64) -> bool {
        let bit = 1u64 << (63 - pos);
        let prev = self.bitmap.fetch_and(!bit, Ordering::AcqRel);
        debug_assert!(prev & bit != 0, "cell {pos} freed while not live");
        prev & !bit == 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap.load(Ordering::Relaxed) == 0
    }

    #[cfg(test)]
    pub fn live_cells(&self) -> u32 {
        self.bitmap.load(Ordering::Relaxed).count_ones()
    }
}

/// Two-level radix table over the high bits of slab-unit addresses.
///
/// Leaves are backed by META blocks supplied by the arenas and are never
/// reclaimed.  Installation races between arenas are settled by CAS; the
/// loser recycles its META block.
pub(crate) struct PageMap {
    root: Box<[AtomicPtr<SlabInfo>]>,
}

impl PageMap {
    pub fn new() -> Self {
        let mut root = Vec::with_capacity(KROOT_LENGTH);
        root.resize_with(KROOT_LENGTH, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            root: root.into_boxed_slice(),
        }
    }

    /// Page-map key of an address inside a slab unit.
    #[inline]
    pub fn key_of(addr: usize) -> usize {
        debug_assert!(addr < 1 << POINTER_BITS, "address beyond 48-bit space");
        addr >> SMALL_BIN_BITS
    }

    #[inline]
    fn indices(key: usize) -> (usize, usize) {
        ((key >> KLEAF_BITS) & (KROOT_LENGTH - 1), key & (KLEAF_LENGTH - 1))
    }

    #[inline]
    pub fn has_leaf(&self, key: usize) -> bool {
        let (i1, _) = Self::indices(key);
        !self.root[i1].load(Ordering::Acquire).is_null()
    }

    /// Descriptor for `key`, or `None` when no leaf covers it.  A present
    /// descriptor with `cell_size() == 0` means "not a slab".
    #[inline]
    pub fn lookup(&self, key: usize) -> Option<&SlabInfo> {
        let (i1, i2) = Self::indices(key);
        let leaf = self.root[i1].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        // Safety: a published leaf spans KLEAF_LENGTH descriptors and is
        // never unpublished.
        Some(unsafe { &*leaf.add(i2) })
    }

    /// Install a leaf backed by `mem` (at least [`LEAF_SIZE`] bytes of META
    /// memory).  Returns false when another thread won the install race, in
    /// which case `mem` remains entirely the caller's.
    ///
    /// # Safety
    /// `mem` must point to at least [`LEAF_SIZE`] writable bytes that outlive
    /// the process (META memory is never reclaimed).
    pub unsafe fn init_leaf(&self, key: usize, mem: NonNull<u8>) -> bool {
        let (i1, _) = Self::indices(key);
        // Safety: caller provides LEAF_SIZE writable bytes.
        unsafe { std::ptr::write_bytes(mem.as_ptr(), 0, LEAF_SIZE) };
        let leaf = mem.as_ptr().cast::<SlabInfo>();
        self.root[i1]
            .compare_exchange(
                std::ptr::null_mut(),
                leaf,
                Ordering::Release,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
