//! Page-locked host memory used as the staging tier between device memory
//! and network buffers.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Chunk, ChunkAllocator};
use crate::error::{HaloError, Result};

const PAGE_SIZE: usize = 4096;

static LOCK_WARNED: AtomicBool = AtomicBool::new(false);

/// Page-aligned host memory, locked into RAM when the process memlock limit
/// allows it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PinnedAllocator;

unsafe fn release_locked(ptr: NonNull<u8>, layout: Layout) {
    #[cfg(unix)]
    libc::munlock(ptr.as_ptr().cast::<libc::c_void>(), layout.size());
    dealloc(ptr.as_ptr(), layout);
}

unsafe fn release_unlocked(ptr: NonNull<u8>, layout: Layout) {
    dealloc(ptr.as_ptr(), layout);
}

#[cfg(unix)]
fn lock_pages(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: the range was just allocated and is owned by the caller.
    unsafe { libc::mlock(ptr.as_ptr().cast::<libc::c_void>(), size) == 0 }
}

#[cfg(not(unix))]
fn lock_pages(_ptr: NonNull<u8>, _size: usize) -> bool {
    false
}

impl ChunkAllocator for PinnedAllocator {
    const KIND: &'static str = "pinned host";

    fn allocate_chunk(&self, size: usize) -> Result<Chunk> {
        let err = || HaloError::Allocation {
            bytes: size,
            kind: Self::KIND,
        };
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| err())?;
        // SAFETY: size > 0 per the ChunkAllocator contract.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(err)?;

        let release = if lock_pages(ptr, size) {
            release_locked
        } else {
            if !LOCK_WARNED.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    bytes = size,
                    "could not page-lock staging memory (memlock limit?); using pageable memory"
                );
            }
            release_unlocked
        };
        // SAFETY: freshly allocated and zeroed with `layout`; the release
        // function matches the locking state.
        Ok(unsafe { Chunk::from_raw(ptr, layout, release) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_chunks_are_page_aligned() {
        let chunk = PinnedAllocator.allocate_chunk(100).unwrap();
        assert_eq!(chunk.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(chunk.size(), 100);
        assert!(chunk.as_slice().iter().all(|&b| b == 0));
    }
}
