// Headers are overlaid on raw mapped memory and their words may be observed
// by the collector while an owning arena rewrites a neighbour (e.g. a split
// shrinking the next block).  Both words are therefore relaxed atomics — the
// decision bits (MERGEABLE) are written only by the collector, so no ordering
// beyond per-word atomicity is needed.  std atomics, not the loom shim: loom
// types are not layout-compatible with raw bytes (see `crate::sync`).
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

/// Every managed block is preceded by 8 bytes of header.
pub(crate) const HEADER_SIZE: usize = 8;

/// Smallest body a split may leave behind.  Free blocks embed two list links
/// in their body, so anything smaller could not be threaded into a free list.
pub(crate) const MIN_SPLIT_BODY: usize = std::mem::size_of::<FreeLinks>();

/// Block is parked in a recycle bin (or owned by the collector) and may be
/// physically merged with adjacent mergeable neighbours.
pub(crate) const FLAG_MERGEABLE: i32 = 1;
/// Block was mapped straight from the OS and bypasses the tiers on free.
pub(crate) const FLAG_BIG: i32 = 2;
/// Block is the head of a slab-hosting chunk and must keep its alignment.
pub(crate) const FLAG_ALIGN: i32 = 4;
/// Block holds internal metadata (a page-map leaf).
pub(crate) const FLAG_META: i32 = 8;

/// Intrusive prefix on every managed block.
///
/// `prev_size` is 0 for the first block of a page and otherwise the body
/// length of the physically preceding block, enabling O(1) backward walks.
/// `word` packs the signed body length (bits 31..4, negative marks the last
/// block of its page) with the four flag bits (bits 3..0).  The sum of
/// `size + HEADER_SIZE` over a page always equals the page's byte length.
#[repr(C)]
pub(crate) struct BlockHeader {
    prev_size: AtomicI32,
    word: AtomicI32,
}

#[inline]
const fn pack(size: i32, flags: i32) -> i32 {
    (size << 4) | flags
}

impl BlockHeader {
    #[inline]
    fn raw_size(&self) -> i32 {
        self.word.load(Ordering::Relaxed) >> 4
    }

    /// Body length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.raw_size().unsigned_abs() as usize
    }

    /// True for the last block of its page.
    #[inline]
    pub fn is_tail(&self) -> bool {
        self.raw_size() < 0
    }

    #[inline]
    pub fn prev_size(&self) -> i32 {
        self.prev_size.load(Ordering::Relaxed)
    }

    /// A block that is simultaneously first and last spans its whole page.
    #[inline]
    pub fn is_whole_page(&self) -> bool {
        self.prev_size() <= 0 && self.is_tail()
    }

    /// # Safety
    /// Caller must own the block (no concurrent structural writer).
    #[inline]
    unsafe fn set_raw_size(&self, size: i32) {
        let flags = self.word.load(Ordering::Relaxed) & 0xF;
        self.word.store(pack(size, flags), Ordering::Relaxed);
    }

    #[inline]
    pub fn has_flag(&self, flag: i32) -> bool {
        self.word.load(Ordering::Relaxed) & flag != 0
    }

    /// # Safety
    /// Caller must own the block (flags have a single writer at a time).
    #[inline]
    pub unsafe fn set_flag(&self, flag: i32) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(w | flag, Ordering::Relaxed);
    }

    /// # Safety
    /// Caller must own the block (flags have a single writer at a time).
    #[inline]
    pub unsafe fn clear_flag(&self, flag: i32) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(w & !flag, Ordering::Relaxed);
    }

    /// Header bits, exposed for round-trip assertions in tests.
    #[cfg(test)]
    pub fn raw_parts(&self) -> (i32, i32) {
        (
            self.prev_size.load(Ordering::Relaxed),
            self.word.load(Ordering::Relaxed),
        )
    }

    /// Turn `self` into the sole (tail) block of a fresh page of `page_len`
    /// bytes.
    ///
    /// # Safety
    /// Caller must own the page exclusively.
    pub unsafe fn init_page(&self, page_len: usize) {
        self.prev_size.store(0, Ordering::Relaxed);
        self.word
            .store(pack(-((page_len - HEADER_SIZE) as i32), 0), Ordering::Relaxed);
    }

    /// First body byte.
    #[inline]
    pub fn data(&self) -> *mut u8 {
        // Blocks live in mapped memory; the &self only covers the header.
        unsafe { std::ptr::from_ref(self).cast_mut().cast::<u8>().add(HEADER_SIZE) }
    }

    /// Physically following block, unless `self` is the page tail.
    ///
    /// # Safety
    /// The header must describe a live block inside a mapped page.
    #[inline]
    pub unsafe fn next(&self) -> Option<NonNull<BlockHeader>> {
        let raw = self.raw_size();
        if raw > 0 {
            // Safety: a positive size means another header follows in-page.
            Some(unsafe { NonNull::new_unchecked(self.data().add(raw as usize).cast()) })
        } else {
            None
        }
    }

    /// Physically preceding block, unless `self` is the first in its page.
    ///
    /// # Safety
    /// The header must describe a live block inside a mapped page.
    #[inline]
    pub unsafe fn prev(&self) -> Option<NonNull<BlockHeader>> {
        let prev_size = self.prev_size();
        if prev_size <= 0 {
            return None;
        }
        let back = prev_size as usize + HEADER_SIZE;
        // Safety: prev_size > 0 means a header precedes us in the same page.
        Some(unsafe {
            NonNull::new_unchecked(
                std::ptr::from_ref(self).cast_mut().cast::<u8>().sub(back).cast(),
            )
        })
    }

    /// Carve a new trailing block starting `at` bytes into the body.
    ///
    /// The new block inherits the tail-sentinel bit; `self` keeps its flags
    /// and becomes an interior block.  Returns `None` (and leaves the block
    /// untouched) when the remainder would be too small to manage.
    ///
    /// # Safety
    /// Caller must own the block exclusively; `at` must be 8-byte aligned.
    pub unsafe fn split_after(&self, at: usize) -> Option<NonNull<BlockHeader>> {
        debug_assert!(at.is_multiple_of(8), "split offset {at} must be 8-byte aligned");
        let body = self.size();
        if body < at + HEADER_SIZE + MIN_SPLIT_BODY {
            return None;
        }
        let rest = (body - at - HEADER_SIZE) as i32;
        // Safety: at + HEADER_SIZE <= body, so the new header is in-page and
        // exclusively ours.
        unsafe {
            let n = &*self.data().add(at).cast::<BlockHeader>();
            n.prev_size.store(at as i32, Ordering::Relaxed);
            n.word.store(
                pack(if self.is_tail() { -rest } else { rest }, 0),
                Ordering::Relaxed,
            );
            self.set_raw_size(at as i32);
            Some(NonNull::from(n))
        }
    }

    /// Absorb the physically next block if it is present and mergeable,
    /// including its header.  Preserves the tail bit and repairs the
    /// following block's `prev_size`.
    ///
    /// # Safety
    /// Collector thread only; both blocks must be free.
    pub unsafe fn merge_next(&self) {
        // Safety: in-page walk per the caller contract.
        unsafe {
            let Some(nxt) = self.next() else { return };
            if !nxt.as_ref().has_flag(FLAG_MERGEABLE) {
                return;
            }
            let grown = (self.size() + nxt.as_ref().size() + HEADER_SIZE) as i32;
            let tail = nxt.as_ref().is_tail();
            self.set_raw_size(if tail { -grown } else { grown });
            if let Some(follow) = self.next() {
                follow
                    .as_ref()
                    .prev_size
                    .store(self.size() as i32, Ordering::Relaxed);
            }
        }
    }

    /// Let the physically previous block absorb `self` if both are mergeable.
    /// Returns the head of the (possibly merged) block.
    ///
    /// # Safety
    /// Same contract as [`merge_next`](Self::merge_next).
    pub unsafe fn merge_prev(&self) -> NonNull<BlockHeader> {
        let this = NonNull::from(self);
        // Safety: in-page walk per the caller contract.
        unsafe {
            match self.prev() {
                Some(p) if p.as_ref().has_flag(FLAG_MERGEABLE) => {
                    p.as_ref().merge_next();
                    p
                }
                _ => this,
            }
        }
    }

    /// Forward link of the embedded queue node (valid only while the block is
    /// threaded on a free list or hand-off list).
    ///
    /// # Safety
    /// The block must currently carry list links in its body.
    #[inline]
    pub unsafe fn queue_next(&self) -> *mut BlockHeader {
        // Safety: per the caller contract the body starts with FreeLinks.
        unsafe { (*self.data().cast::<FreeLinks>()).next }
    }
}

/// The first 16 body bytes of a free block, reused as list links.
#[repr(C)]
pub(crate) struct FreeLinks {
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
}

/// Unordered doubly-linked list threaded through the bodies of free blocks.
/// Single-owner: either one arena or the collector, never shared.
pub(crate) struct BlockList {
    head: *mut BlockHeader,
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    unsafe fn links(h: NonNull<BlockHeader>) -> *mut FreeLinks {
        // Safety: free blocks always have >= MIN_SPLIT_BODY body bytes.
        unsafe { h.as_ref().data().cast::<FreeLinks>() }
    }

    /// # Safety
    /// `h` must be a free block owned by this list's owner, not already on a
    /// list, with a body of at least [`MIN_SPLIT_BODY`] bytes.
    pub unsafe fn push(&mut self, h: NonNull<BlockHeader>) {
        debug_assert!(h.as_ref().size() >= MIN_SPLIT_BODY);
        // Safety: per caller contract the body can hold the links.
        unsafe {
            let links = Self::links(h);
            (*links).next = self.head;
            (*links).prev = std::ptr::null_mut();
            if let Some(old) = NonNull::new(self.head) {
                (*Self::links(old)).prev = h.as_ptr();
            }
        }
        self.head = h.as_ptr();
    }

    /// # Safety
    /// List links of the contained blocks must still be intact.
    pub unsafe fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
        let head = NonNull::new(self.head)?;
        // Safety: head is on the list, links intact per caller contract.
        unsafe {
            let next = (*Self::links(head)).next;
            if let Some(n) = NonNull::new(next) {
                (*Self::links(n)).prev = std::ptr::null_mut();
            }
            self.head = next;
        }
        Some(head)
    }

    /// O(1) removal of a block known to be on this list.
    ///
    /// # Safety
    /// `h` must currently be threaded on this list.
    pub unsafe fn remove(&mut self, h: NonNull<BlockHeader>) {
        // Safety: h is on the list per caller contract.
        unsafe {
            let links = Self::links(h);
            let prev = (*links).prev;
            let next = (*links).next;
            if prev.is_null() {
                debug_assert_eq!(self.head, h.as_ptr());
                self.head = next;
            } else {
                (*Self::links(NonNull::new_unchecked(prev))).next = next;
            }
            if let Some(n) = NonNull::new(next) {
                (*Self::links(n)).prev = prev;
            }
        }
    }

    pub fn peek(&self) -> Option<NonNull<BlockHeader>> {
        NonNull::new(self.head)
    }

    /// Detach the whole list, returning its head.  Used by the hand-off to
    /// publish an entire batch in one store.
    #[inline]
    pub fn take_head(&mut self) -> *mut BlockHeader {
        std::mem::replace(&mut self.head, std::ptr::null_mut())
    }
}

/// A [`BlockList`] whose `pop` trims oversized entries down to a fixed unit,
/// pushing the remainder back.  Second-level cache of the fixed-bin path.
pub(crate) struct FixedBlockList {
    list: BlockList,
    unit: usize,
}

impl FixedBlockList {
    pub const fn new(unit: usize) -> Self {
        Self {
            list: BlockList::new(),
            unit,
        }
    }

    /// # Safety
    /// Same contract as [`BlockList::push`].
    pub unsafe fn push(&mut self, h: NonNull<BlockHeader>) {
        // Safety: forwarded contract.
        unsafe { self.list.push(h) }
    }

    /// Pop one unit, splitting an oversized block and keeping the remainder.
    ///
    /// # Safety
    /// Same contract as [`BlockList::pop`].
    pub unsafe fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: forwarded contract; split keeps the remainder list-worthy.
        unsafe {
            let h = self.list.pop()?;
            if h.as_ref().size() > self.unit
                && let Some(rest) = h.as_ref().split_after(self.unit)
            {
                self.list.push(rest);
            }
            Some(h)
        }
    }

    /// Pop without trimming.  Used when draining the cache wholesale.
    ///
    /// # Safety
    /// Same contract as [`BlockList::pop`].
    pub unsafe fn pop_chunk(&mut self) -> Option<NonNull<BlockHeader>> {
        // Safety: forwarded contract.
        unsafe { self.list.pop() }
    }
}
