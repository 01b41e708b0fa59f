use super::block::BlockHeader;
use crate::sync::atomic::AtomicPtr;

/// Ring capacity.  Must be a power of two.  Kept small under loom so model
/// state spaces stay tractable.
#[cfg(not(loom))]
pub(crate) const QUEUE_SIZE: usize = 128;
#[cfg(loom)]
pub(crate) const QUEUE_SIZE: usize = 8;

const _: () = assert!(QUEUE_SIZE.is_power_of_two(), "ring capacity must be a power of 2");

/// Fixed-capacity slot array indexed modulo capacity.
///
/// The ring carries no synchronisation of its own beyond per-slot atomicity;
/// the recycle bin's claim/publish protocol decides who may touch which slot.
pub(crate) struct RingBuffer {
    slots: [AtomicPtr<BlockHeader>; QUEUE_SIZE],
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Slot for logical position `pos`.
    #[inline]
    pub fn at(&self, pos: isize) -> &AtomicPtr<BlockHeader> {
        &self.slots[(pos as usize) & (QUEUE_SIZE - 1)]
    }
}
