//! Owned staging buffers with a pluggable allocation strategy.
//!
//! A [`Buffer`] owns at most one [`Chunk`]. The chunk's release function is
//! chosen by the allocator when the chunk is created and runs from `Drop`,
//! so memory obtained from one strategy is always returned to the same
//! strategy no matter how the owning buffer is later used.
//!
//! Buffers are scratch space: growing or shrinking discards the contents.

mod host;
mod pinned;

pub use host::HostAllocator;
pub use pinned::PinnedAllocator;

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::{HaloError, Result};

/// Function that returns a chunk to the allocator it came from.
pub(crate) type ReleaseFn = unsafe fn(NonNull<u8>, Layout);

/// A single contiguous allocation.
pub struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
    release: ReleaseFn,
}

// SAFETY: a chunk is uniquely owned and only accessed through `&`/`&mut`.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Wrap raw memory. `ptr` must have been allocated with `layout` and must
    /// stay valid until `release(ptr, layout)` is called, and the first
    /// `layout.size()` bytes must be initialized.
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>, layout: Layout, release: ReleaseFn) -> Self {
        Self { ptr, layout, release }
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid and initialized for layout.size() bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and initialized for layout.size() bytes, and
        // we hold the only reference.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: the release function was paired with this allocation by
        // the allocator that produced it.
        unsafe { (self.release)(self.ptr, self.layout) }
    }
}

/// Allocation strategy for a [`Buffer`].
pub trait ChunkAllocator: Send + Sync {
    /// Human readable name, used in errors and logs.
    const KIND: &'static str;

    /// Allocate a zero-filled chunk of exactly `size` bytes (`size > 0`).
    fn allocate_chunk(&self, size: usize) -> Result<Chunk>;
}

/// An owned, resizable memory region.
pub struct Buffer<A: ChunkAllocator> {
    allocator: A,
    chunk: Option<Chunk>,
}

pub type HostBuffer = Buffer<HostAllocator>;
pub type PinnedBuffer = Buffer<PinnedAllocator>;

impl<A: ChunkAllocator + Default> Default for Buffer<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: ChunkAllocator> Buffer<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            chunk: None,
        }
    }

    /// Replace the owned chunk with a fresh one of exactly `size` bytes.
    /// The previous chunk is released first.
    pub fn allocate(&mut self, size: usize) -> Result<()> {
        self.chunk = None;
        if size > 0 {
            self.chunk = Some(self.allocator.allocate_chunk(size)?);
        }
        Ok(())
    }

    /// Grow to at least `size` bytes. Never shrinks; contents are lost on growth.
    pub fn ensure_capacity(&mut self, size: usize) -> Result<()> {
        if self.size() >= size {
            return Ok(());
        }
        self.allocate(size)
    }

    /// Reduce the footprint to `size` bytes if currently larger.
    pub fn shrink(&mut self, size: usize) -> Result<()> {
        if self.size() <= size {
            return Ok(());
        }
        self.allocate(size)
    }

    /// Release the chunk, leaving an empty buffer.
    pub fn free(&mut self) {
        self.chunk = None;
    }

    pub fn size(&self) -> usize {
        self.chunk.as_ref().map_or(0, Chunk::size)
    }

    /// Raw pointer to the chunk; null iff the buffer is empty.
    pub fn as_ptr(&self) -> *const u8 {
        self.chunk.as_ref().map_or(std::ptr::null(), Chunk::as_ptr)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.chunk.as_ref().map_or(&[], Chunk::as_slice)
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.chunk.as_mut() {
            Some(chunk) => chunk.as_mut_slice(),
            None => &mut [],
        }
    }

    /// The first `len` bytes, failing if the buffer is smaller.
    pub fn prefix(&self, len: usize) -> Result<&[u8]> {
        self.as_slice().get(..len).ok_or(HaloError::SizeMismatch {
            expected: len,
            found: self.size(),
        })
    }

    pub fn prefix_mut(&mut self, len: usize) -> Result<&mut [u8]> {
        let found = self.size();
        self.as_mut_slice()
            .get_mut(..len)
            .ok_or(HaloError::SizeMismatch { expected: len, found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_has_null_pointer() {
        let buf = HostBuffer::default();
        assert!(buf.as_ptr().is_null());
        assert_eq!(buf.size(), 0);
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn ensure_capacity_grows_but_never_shrinks() {
        let mut buf = HostBuffer::default();
        buf.ensure_capacity(64).unwrap();
        assert_eq!(buf.size(), 64);
        assert!(!buf.as_ptr().is_null());
        buf.ensure_capacity(16).unwrap();
        assert_eq!(buf.size(), 64);
        buf.ensure_capacity(128).unwrap();
        assert_eq!(buf.size(), 128);
    }

    #[test]
    fn shrink_reduces_footprint() {
        let mut buf = HostBuffer::default();
        buf.allocate(256).unwrap();
        buf.shrink(32).unwrap();
        assert_eq!(buf.size(), 32);
        buf.shrink(64).unwrap();
        assert_eq!(buf.size(), 32);
    }

    #[test]
    fn allocate_zero_releases() {
        let mut buf = PinnedBuffer::default();
        buf.allocate(4096).unwrap();
        assert_eq!(buf.size(), 4096);
        buf.allocate(0).unwrap();
        assert!(buf.as_ptr().is_null());
    }

    #[test]
    fn prefix_checks_length() {
        let mut buf = HostBuffer::default();
        buf.allocate(8).unwrap();
        buf.prefix_mut(4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.prefix(4).unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(
            buf.prefix(9),
            Err(HaloError::SizeMismatch { expected: 9, found: 8 })
        ));
    }
}
