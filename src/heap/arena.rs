use super::block::{
    BlockHeader, FLAG_ALIGN, FLAG_BIG, FLAG_META, FixedBlockList, HEADER_SIZE,
};
use super::collector::CollectorShared;
use super::handoff::ThreadHandoff;
use super::page_map::{
    LEAF_SIZE, META_CHUNK_SIZE, PageMap, SMALL_BIN_CAPACITY, SMALL_BIN_SIZE, SlabInfo,
};
use super::size_class::{NUM_BINS, NUM_LARGE_BINS, NUM_SMALL_BINS, class_of, max_size_of, step_of};
use super::{
    ALIGN_CHUNK_SIZE, CHUNK_SIZE, LARGE_BLOCK, LIST_CACHE_NUM, MAX_BLOCK_BODY, MIN_BLOCK_SIZE,
    SMALL_BLOCK, vm,
};
use crate::sync::Arc;
use std::ptr::NonNull;

/// Middle-tier claims per refill of the meta list.
const META_LIST_CLAIMS: usize = LIST_CACHE_NUM / 2;

/// Per-thread allocator front end.
///
/// Holds three sub-allocators: single-slot front caches per variable class,
/// front caches plus a unit list for the slab classes, and a unit list
/// supplying page-map leaves.  Everything here is thread-private; the only
/// shared touchpoints are ring claims, hand-off releases, and the page map.
pub(crate) struct ThreadArena {
    shared: Arc<CollectorShared>,
    node: NonNull<ThreadHandoff>,
    /// First-level cache per variable class, indexed by `class - NUM_SMALL_BINS`.
    large_cache: [*mut BlockHeader; NUM_LARGE_BINS + 1],
    /// First-level cache per slab class: the slab currently being carved.
    small_cache: [*mut BlockHeader; NUM_SMALL_BINS + 1],
    /// Second-level cache of slab-sized units.
    slab_list: FixedBlockList,
    /// Second-level cache of page-map leaf blocks.
    meta_list: FixedBlockList,
}

impl ThreadArena {
    pub fn new(shared: Arc<CollectorShared>) -> Self {
        let node = shared.registry.register();
        Self {
            shared,
            node,
            large_cache: [std::ptr::null_mut(); NUM_LARGE_BINS + 1],
            small_cache: [std::ptr::null_mut(); NUM_SMALL_BINS + 1],
            slab_list: FixedBlockList::new(SMALL_BIN_SIZE),
            meta_list: FixedBlockList::new(LEAF_SIZE),
        }
    }

    /// Hand a freed block to the collector through this thread's hand-off.
    ///
    /// # Safety
    /// `h` must be free, unreachable from anywhere else, with intact body
    /// space for the hand-off links.
    unsafe fn release(&self, h: NonNull<BlockHeader>) {
        // Safety: the node outlives the arena; contract forwarded.
        unsafe { self.node.as_ref().release(h) };
    }

    /// Allocate `size` usable bytes.  Returns an 8-byte-aligned pointer or
    /// `None` when `size` is 0, unrepresentable, or the OS refuses memory.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > MAX_BLOCK_BODY {
            return None;
        }
        let size = size.max(MIN_BLOCK_SIZE);
        if size <= SMALL_BLOCK {
            self.alloc_small(size)
        } else if size + HEADER_SIZE < LARGE_BLOCK {
            self.alloc_large(size)
        } else {
            self.alloc_huge(size)
        }
    }

    // ------------------------------------------------------------------
    // slab path
    // ------------------------------------------------------------------

    fn alloc_small(&mut self, size: usize) -> Option<NonNull<u8>> {
        let bin = class_of(size);
        debug_assert!((1..=NUM_SMALL_BINS).contains(&bin));

        if let Some(slab) = NonNull::new(self.small_cache[bin]) {
            if let Some(p) = self.carve_cell(bin, slab) {
                return Some(p);
            }
            // stale or full slab in the slot; refetch below
            self.small_cache[bin] = std::ptr::null_mut();
        }

        let slab = self.fetch_slab()?;
        if self.adopt_slab(slab, max_size_of(bin) as u32).is_none() {
            // no leaf memory; give the unit back rather than leak it
            // Safety: the unit is free and ours.
            unsafe { self.release(slab) };
            return None;
        }
        self.small_cache[bin] = slab.as_ptr();
        self.carve_cell(bin, slab)
    }

    /// Take one cell from a cached slab.  `None` means the slot is useless
    /// (full, or its descriptor no longer matches this class).
    fn carve_cell(&mut self, bin: usize, slab: NonNull<BlockHeader>) -> Option<NonNull<u8>> {
        let key = PageMap::key_of(slab.as_ptr() as usize);
        let info = self.shared.page_map.lookup(key)?;
        let cell = info.cell_size();
        if cell as usize != max_size_of(bin) {
            return None;
        }
        let (pos, full) = info.acquire_cell(SlabInfo::capacity_for(cell))?;
        if full {
            self.small_cache[bin] = std::ptr::null_mut();
        }
        // Safety: pos < capacity keeps the cell inside the slab body.
        let p = unsafe { slab.as_ref().data().add(pos as usize * cell as usize) };
        NonNull::new(p)
    }

    /// Pop a slab unit, falling back to the middle tier and then to a fresh
    /// aligned chunk carved into [`LIST_CACHE_NUM`] units.
    fn fetch_slab(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: list blocks are free and arena-owned throughout.
        unsafe {
            if let Some(h) = self.pop_slab_unit() {
                return Some(h);
            }

            let mut found = false;
            for _ in 0..LIST_CACHE_NUM {
                match self.shared.align_bin.claim() {
                    Some(h) => {
                        self.slab_list.push(h);
                        found = true;
                    }
                    None => break,
                }
            }
            if found && let Some(h) = self.pop_slab_unit() {
                return Some(h);
            }

            let page = vm::map_block_page(ALIGN_CHUNK_SIZE).ok()?;
            page.as_ref().set_flag(FLAG_ALIGN);
            let Some(mut tail) = page.as_ref().split_after(SMALL_BIN_SIZE) else {
                return Some(page);
            };
            for _ in 0..LIST_CACHE_NUM - 1 {
                match tail.as_ref().split_after(SMALL_BIN_SIZE) {
                    Some(rest) => {
                        self.slab_list.push(tail);
                        tail = rest;
                    }
                    None => {
                        self.slab_list.push(tail);
                        return Some(page);
                    }
                }
            }
            self.release(tail);
            Some(page)
        }
    }

    /// Pop from the slab list, discarding ragged fragments that cannot host a
    /// full slab (merged spans do not always divide evenly into units).
    unsafe fn pop_slab_unit(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: list blocks are free and arena-owned.
        unsafe {
            loop {
                let h = self.slab_list.pop()?;
                if h.as_ref().size() >= SMALL_BIN_SIZE {
                    return Some(h);
                }
                self.release(h);
            }
        }
    }

    /// Make sure the page map can describe `slab`, then bind its descriptor
    /// to `cell`-sized cells.
    fn adopt_slab(&mut self, slab: NonNull<BlockHeader>, cell: u32) -> Option<()> {
        let key = PageMap::key_of(slab.as_ptr() as usize);
        if !self.shared.page_map.has_leaf(key) {
            let meta = self.fetch_meta()?;
            // Safety: META blocks are process-lifetime; body >= LEAF_SIZE.
            let installed = unsafe {
                let body = NonNull::new_unchecked(meta.as_ref().data());
                self.shared.page_map.init_leaf(key, body)
            };
            if !installed {
                // another thread won the install race; recycle our leaf block
                // Safety: the block is free and ours.
                unsafe { self.release(meta) };
            }
        }
        let info = self.shared.page_map.lookup(key)?;
        info.install(cell);
        Some(())
    }

    /// Pop a leaf-sized META block, falling back to the middle tier and then
    /// to a fresh META chunk.
    fn fetch_meta(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: list blocks are free and arena-owned throughout.
        unsafe {
            if let Some(h) = self.pop_meta_unit() {
                return Some(h);
            }

            let mut found = false;
            for _ in 0..META_LIST_CLAIMS {
                match self.shared.meta_bin.claim() {
                    Some(h) => {
                        self.meta_list.push(h);
                        found = true;
                    }
                    None => break,
                }
            }
            if found && let Some(h) = self.pop_meta_unit() {
                return Some(h);
            }

            let page = vm::map_block_page(META_CHUNK_SIZE).ok()?;
            page.as_ref().set_flag(FLAG_META);
            let Some(mut tail) = page.as_ref().split_after(LEAF_SIZE) else {
                return Some(page);
            };
            // every piece of a META chunk keeps the META tag so merged
            // remainders route back to the meta bin
            tail.as_ref().set_flag(FLAG_META);
            for _ in 0..META_LIST_CLAIMS.saturating_sub(1) {
                match tail.as_ref().split_after(LEAF_SIZE) {
                    Some(rest) => {
                        rest.as_ref().set_flag(FLAG_META);
                        self.meta_list.push(tail);
                        tail = rest;
                    }
                    None => {
                        self.meta_list.push(tail);
                        return Some(page);
                    }
                }
            }
            self.release(tail);
            Some(page)
        }
    }

    unsafe fn pop_meta_unit(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: list blocks are free and arena-owned.
        unsafe {
            loop {
                let h = self.meta_list.pop()?;
                if h.as_ref().size() >= LEAF_SIZE {
                    return Some(h);
                }
                self.release(h);
            }
        }
    }

    // ------------------------------------------------------------------
    // variable path
    // ------------------------------------------------------------------

    fn alloc_large(&mut self, size: usize) -> Option<NonNull<u8>> {
        // split offsets must keep the next header 8-byte aligned
        let at = size.next_multiple_of(8);
        let min_bin = class_of(size + HEADER_SIZE);
        debug_assert!(min_bin > NUM_SMALL_BINS);

        let mut bin = min_bin;
        while bin <= NUM_BINS {
            if let Some(h) = self.fetch_front_and_middle(bin - NUM_SMALL_BINS) {
                // Safety: claimed and cached blocks are exclusively ours.
                unsafe {
                    if h.as_ref().size() >= at {
                        if let Some(tail) = h.as_ref().split_after(at) {
                            self.cache_tail(tail);
                        }
                        return NonNull::new(h.as_ref().data());
                    }
                    // undersized stray (fragments park in the lowest bin
                    // until merging grows them); recycle and keep scanning
                    self.release(h);
                }
            }
            bin += step_of(bin);
        }

        let page = vm::map_block_page(CHUNK_SIZE).ok()?;
        // Safety: fresh page, exclusively ours.
        unsafe {
            if let Some(tail) = page.as_ref().split_after(at) {
                self.cache_tail(tail);
            }
            Some(NonNull::new_unchecked(page.as_ref().data()))
        }
    }

    /// Front cache first; otherwise two middle-tier claims, parking the first
    /// and returning the second, falling back to whichever succeeded.
    fn fetch_front_and_middle(&mut self, idx: usize) -> Option<NonNull<BlockHeader>> {
        let slot = &mut self.large_cache[idx];
        if let Some(h) = NonNull::new(std::mem::replace(slot, std::ptr::null_mut())) {
            return Some(h);
        }

        let first = self.shared.bins[idx].claim()?;
        self.large_cache[idx] = first.as_ptr();
        if let Some(second) = self.shared.bins[idx].claim() {
            return Some(second);
        }
        NonNull::new(std::mem::replace(&mut self.large_cache[idx], std::ptr::null_mut()))
    }

    /// Park a split tail in its own class's front cache, or hand it to the
    /// collector when that slot is taken (or the tail is sub-variable sized).
    fn cache_tail(&mut self, tail: NonNull<BlockHeader>) {
        // Safety: the tail is a fresh split, exclusively ours.
        let class = class_of(unsafe { tail.as_ref().size() });
        if class > NUM_SMALL_BINS {
            let idx = class - NUM_SMALL_BINS;
            if self.large_cache[idx].is_null() {
                self.large_cache[idx] = tail.as_ptr();
                return;
            }
        }
        // Safety: same ownership.
        unsafe { self.release(tail) };
    }

    // ------------------------------------------------------------------
    // huge path
    // ------------------------------------------------------------------

    fn alloc_huge(&mut self, size: usize) -> Option<NonNull<u8>> {
        let page = vm::map_block_page(size + HEADER_SIZE).ok()?;
        // Safety: fresh page, exclusively ours.
        unsafe {
            page.as_ref().set_flag(FLAG_BIG);
            Some(NonNull::new_unchecked(page.as_ref().data()))
        }
    }

    // ------------------------------------------------------------------
    // free path
    // ------------------------------------------------------------------

    /// Free a pointer previously returned by any arena of the same heap.
    ///
    /// # Safety
    /// `p` must come from [`alloc`](Self::alloc) on an arena sharing this
    /// arena's [`CollectorShared`], and must not have been freed already.
    pub unsafe fn free(&mut self, p: NonNull<u8>) {
        let addr = p.as_ptr() as usize;
        if let Some(info) = self.shared.page_map.lookup(PageMap::key_of(addr)) {
            let cell = info.cell_size();
            if cell != 0 {
                let offset = (addr & (SMALL_BIN_CAPACITY - 1)) - HEADER_SIZE;
                let pos = (offset / cell as usize) as u64;
                if info.release_cell(pos) {
                    // last cell gone: detach the descriptor before anyone can
                    // see the address as a slab again, then recycle the unit
                    info.clear();
                    let slab = (addr & !(SMALL_BIN_CAPACITY - 1)) as *mut BlockHeader;
                    let bin = class_of(cell as usize);
                    if self.small_cache[bin] == slab {
                        self.small_cache[bin] = std::ptr::null_mut();
                    }
                    // Safety: empty slab, detached from the page map.
                    unsafe { self.release(NonNull::new_unchecked(slab)) };
                }
                return;
            }
        }

        // Safety: non-slab pointers were returned as header + body.
        unsafe {
            let h = NonNull::new_unchecked(p.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>());
            if h.as_ref().has_flag(FLAG_BIG) {
                vm::unmap_block_page(h, h.as_ref().size() + HEADER_SIZE);
            } else if h.as_ref().size() <= LARGE_BLOCK {
                self.release(h);
            } else {
                vm::unmap_block_page(h, h.as_ref().size() + HEADER_SIZE);
            }
        }
    }
}

impl Drop for ThreadArena {
    fn drop(&mut self) {
        // Safety: the arena is going away; residual caches are free blocks it
        // exclusively owns.  The registry node outlives us and is reclaimed
        // by the collector once it observes `done`.
        unsafe {
            for idx in 0..=NUM_LARGE_BINS {
                if let Some(h) =
                    NonNull::new(std::mem::replace(&mut self.large_cache[idx], std::ptr::null_mut()))
                {
                    self.release(h);
                }
            }
            for bin in 1..=NUM_SMALL_BINS {
                let slot = std::mem::replace(&mut self.small_cache[bin], std::ptr::null_mut());
                if let Some(slab) = NonNull::new(slot) {
                    let key = PageMap::key_of(slab.as_ptr() as usize);
                    if let Some(info) = self.shared.page_map.lookup(key)
                        && info.cell_size() != 0
                        && info.is_empty()
                    {
                        // untouched slab: detach and recycle it; occupied
                        // slabs are released by whichever free empties them
                        info.clear();
                        self.release(slab);
                    }
                }
            }
            while let Some(h) = self.slab_list.pop_chunk() {
                self.release(h);
            }
            while let Some(h) = self.meta_list.pop_chunk() {
                self.release(h);
            }
            self.node.as_ref().mark_done();
        }
    }
}
