use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use super::{Chunk, ChunkAllocator};
use crate::error::{HaloError, Result};

const HOST_ALIGN: usize = 64;

/// Plain heap memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostAllocator;

unsafe fn release_host(ptr: NonNull<u8>, layout: Layout) {
    dealloc(ptr.as_ptr(), layout);
}

impl HostAllocator {
    /// Zeroed allocation with a caller-chosen alignment. Shared with the
    /// emulated device backend.
    pub(crate) fn allocate_aligned(size: usize, align: usize) -> Result<Chunk> {
        let err = HaloError::Allocation {
            bytes: size,
            kind: Self::KIND,
        };
        let layout = Layout::from_size_align(size, align).map_err(|_| err)?;
        // SAFETY: layout has non-zero size (checked by callers).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HaloError::Allocation {
            bytes: size,
            kind: Self::KIND,
        })?;
        // SAFETY: freshly allocated and zeroed with `layout`.
        Ok(unsafe { Chunk::from_raw(ptr, layout, release_host) })
    }
}

impl ChunkAllocator for HostAllocator {
    const KIND: &'static str = "host";

    fn allocate_chunk(&self, size: usize) -> Result<Chunk> {
        Self::allocate_aligned(size, HOST_ALIGN)
    }
}
