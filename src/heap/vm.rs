use super::block::BlockHeader;
use super::stats;
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "page unmapping failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for the two page primitives the allocator needs.
pub(crate) trait PageOps {
    /// Map `size` bytes of zeroed, read-write, private anonymous memory.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Return a mapping obtained from [`map`](Self::map) to the OS.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageOps, PlatformVmOps, VmError};
    use std::io;

    impl PageOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: 64-bit targets only; the page size fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("gcmalloc currently supports unix targets (or loom/miri mock builds) only.");

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed PageOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler.  Every "mapping" is a plain heap
// allocation instead.  4096-byte alignment preserves the slab-unit alignment
// the page-map keying relies on.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// Map a fresh page and stamp it with a single whole-page block header.
pub(crate) fn map_block_page(size: usize) -> Result<NonNull<BlockHeader>, VmError> {
    // Safety: size is a valid mapping length chosen by the caller.
    let ptr = unsafe { PlatformVmOps::map(size)? };
    // slab-unit keying needs 1 KiB alignment, which page alignment implies
    debug_assert!(
        (ptr.as_ptr() as usize).is_multiple_of(PlatformVmOps::page_size()),
        "OS mapping is not page-aligned"
    );
    stats::TOTAL_MAPPED.add(size);
    stats::LIVE_PAGES.add(1);
    let page = ptr.cast::<BlockHeader>();
    // Safety: freshly mapped, exclusively owned, large enough for a header.
    unsafe { page.as_ref().init_page(size) };
    Ok(page)
}

/// Return a whole page to the OS.  Failures are reported to standard error
/// and otherwise ignored; the allocator keeps running.
///
/// # Safety
/// `page` must head a mapping of exactly `size` bytes obtained from
/// [`map_block_page`], with no live blocks inside it.
pub(crate) unsafe fn unmap_block_page(page: NonNull<BlockHeader>, size: usize) {
    // Safety: forwarded caller contract.
    if let Err(e) = unsafe { PlatformVmOps::unmap(page.cast(), size) } {
        eprintln!("gcmalloc: failed to unmap page {:p} ({size} bytes): {e}", page);
        return;
    }
    stats::TOTAL_UNMAPPED.add(size);
    stats::LIVE_PAGES.sub(1);
}
