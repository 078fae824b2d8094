//! Device memory and copy streams.
//!
//! A [`DeviceContext`] is either a wgpu device or an emulated device whose
//! memory lives on the host. Both pad rows of pitched allocations, so code
//! that forgets the pitch shows up in tests run on the emulated device too.

mod gpu;

pub use gpu::WgpuDevice;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::{Chunk, HostAllocator};
use crate::error::{HaloError, Result};
use crate::index::{for_each_row, linear_offset, IndexArray, MAX_DIMS};

const EMULATED_PITCH_ALIGN: usize = 64;

/// Which device implementation backs a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Emulated,
    Wgpu,
}

impl FromStr for DeviceKind {
    type Err = HaloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emulated" | "host" | "cpu" => Ok(DeviceKind::Emulated),
            "wgpu" | "gpu" => Ok(DeviceKind::Wgpu),
            other => Err(HaloError::Device(format!("unknown device kind '{other}'"))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Emulated => write!(f, "emulated"),
            DeviceKind::Wgpu => write!(f, "wgpu"),
        }
    }
}

/// Ordering handle for device copies. Copies issued on one stream complete
/// in issue order; `Stream::DEFAULT` orders against everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stream(u32);

impl Stream {
    pub const DEFAULT: Stream = Stream(0);

    pub fn id(self) -> u32 {
        self.0
    }
}

enum Backend {
    Emulated,
    Gpu(WgpuDevice),
}

pub struct DeviceContext {
    backend: Backend,
    next_stream: AtomicU32,
}

impl DeviceContext {
    pub fn emulated() -> Arc<Self> {
        Arc::new(Self {
            backend: Backend::Emulated,
            next_stream: AtomicU32::new(1),
        })
    }

    pub fn wgpu() -> Result<Arc<Self>> {
        let device = WgpuDevice::new()?;
        tracing::info!(adapter = device.adapter_name(), "using wgpu device");
        Ok(Arc::new(Self {
            backend: Backend::Gpu(device),
            next_stream: AtomicU32::new(1),
        }))
    }

    pub fn from_kind(kind: DeviceKind) -> Result<Arc<Self>> {
        match kind {
            DeviceKind::Emulated => Ok(Self::emulated()),
            DeviceKind::Wgpu => Self::wgpu(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self.backend {
            Backend::Emulated => DeviceKind::Emulated,
            Backend::Gpu(_) => DeviceKind::Wgpu,
        }
    }

    /// Byte alignment of pitched rows.
    pub fn pitch_alignment(&self) -> usize {
        match self.backend {
            Backend::Emulated => EMULATED_PITCH_ALIGN,
            Backend::Gpu(_) => gpu::PITCH_ALIGN,
        }
    }

    pub fn create_stream(&self) -> Stream {
        Stream(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    /// Wait for every copy issued on `stream`.
    pub fn synchronize(&self, stream: Stream) {
        tracing::trace!(stream = stream.id(), "synchronize");
        if let Backend::Gpu(dev) = &self.backend {
            dev.wait();
        }
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory> {
        match &self.backend {
            Backend::Emulated => Ok(DeviceMemory::Emulated(HostAllocator::allocate_aligned(
                bytes,
                EMULATED_PITCH_ALIGN,
            )?)),
            Backend::Gpu(dev) => Ok(DeviceMemory::Gpu(dev.create_buffer(bytes))),
        }
    }
}

enum DeviceMemory {
    Emulated(Chunk),
    Gpu(wgpu::Buffer),
}

/// Device memory holding a pitched N-d region or a linear byte range.
pub struct DeviceBuffer {
    ctx: Arc<DeviceContext>,
    memory: Option<DeviceMemory>,
    elm_size: usize,
    num_dims: usize,
    size: IndexArray,
    pitch: usize,
    capacity: usize,
    stream: Stream,
}

impl DeviceBuffer {
    pub fn new(ctx: Arc<DeviceContext>, elm_size: usize) -> Self {
        Self {
            ctx,
            memory: None,
            elm_size,
            num_dims: 1,
            size: IndexArray::splat(1),
            pitch: 0,
            capacity: 0,
            stream: Stream::DEFAULT,
        }
    }

    fn check_element_size(&self) -> Result<()> {
        if self.ctx.kind() == DeviceKind::Wgpu && self.elm_size as u64 % gpu::COPY_ALIGN != 0 {
            return Err(HaloError::Device(format!(
                "element size {} is not a multiple of {} bytes",
                self.elm_size,
                gpu::COPY_ALIGN
            )));
        }
        Ok(())
    }

    /// Allocate a pitched region of logical extent `size`. Any previous
    /// allocation is released first.
    pub fn allocate(&mut self, num_dims: usize, size: IndexArray) -> Result<()> {
        self.check_element_size()?;
        self.memory = None;
        self.capacity = 0;
        self.num_dims = num_dims;
        self.size = IndexArray::from_slice(&size.0[..num_dims], 1);

        let row = self.size[0].max(0) as usize * self.elm_size;
        let align = self.ctx.pitch_alignment();
        self.pitch = row.div_ceil(align) * align;
        let rows = (self.size[1] * self.size[2]).max(0) as usize;
        let bytes = self.pitch * rows;
        if bytes > 0 {
            self.memory = Some(self.ctx.allocate(bytes)?);
            self.capacity = bytes;
        }
        Ok(())
    }

    /// Grow a linear (unpitched) allocation to at least `bytes`.
    pub fn ensure_linear_capacity(&mut self, bytes: usize) -> Result<()> {
        self.check_element_size()?;
        self.num_dims = 1;
        self.size = IndexArray::new((bytes / self.elm_size.max(1)) as i64, 1, 1);
        self.pitch = bytes;
        if self.capacity >= bytes {
            return Ok(());
        }
        self.memory = Some(self.ctx.allocate(bytes)?);
        self.capacity = bytes;
        Ok(())
    }

    pub fn free(&mut self) {
        self.memory = None;
        self.capacity = 0;
    }

    pub fn is_allocated(&self) -> bool {
        self.memory.is_some()
    }

    /// Row pitch in bytes.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn size(&self) -> IndexArray {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn elm_size(&self) -> usize {
        self.elm_size
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn set_stream(&mut self, stream: Stream) {
        self.stream = stream;
    }

    /// Byte ranges of the rows of `[offset, offset + size)`, outermost
    /// dimension slowest.
    fn region_rows(&self, offset: &IndexArray, size: &IndexArray) -> Result<Vec<(usize, usize)>> {
        let offset = &IndexArray::from_slice(&offset.0[..self.num_dims], 0);
        for d in 0..MAX_DIMS {
            let (lo, n) = if d < self.num_dims { (offset[d], size[d]) } else { (0, 1) };
            if lo < 0 || n < 0 || lo + n > self.size[d] {
                return Err(HaloError::Device(format!(
                    "region {offset} + {size} outside device buffer of size {}",
                    self.size
                )));
            }
        }
        let pitch_elems = (self.pitch / self.elm_size) as i64;
        let len = size[0] as usize * self.elm_size;
        let mut rows = Vec::new();
        for_each_row(size, self.num_dims, |r| {
            let start = linear_offset(&(*offset + r), &self.size, pitch_elems) as usize * self.elm_size;
            rows.push((start, len));
        });
        Ok(rows)
    }

    /// Copy the packed host array `src` into the region `[offset, offset + size)`.
    pub fn copy_in_region(&mut self, src: &[u8], offset: &IndexArray, size: &IndexArray) -> Result<()> {
        let rows = self.region_rows(offset, size)?;
        let total: usize = rows.iter().map(|r| r.1).sum();
        if src.len() < total {
            return Err(HaloError::SizeMismatch {
                expected: total,
                found: src.len(),
            });
        }
        tracing::trace!(stream = self.stream.id(), bytes = total, "device copy-in");
        self.write_rows(&rows, src)
    }

    /// Copy the region `[offset, offset + size)` out into the packed host array `dst`.
    pub fn copy_out_region(&self, dst: &mut [u8], offset: &IndexArray, size: &IndexArray) -> Result<()> {
        let rows = self.region_rows(offset, size)?;
        let total: usize = rows.iter().map(|r| r.1).sum();
        if dst.len() < total {
            return Err(HaloError::SizeMismatch {
                expected: total,
                found: dst.len(),
            });
        }
        tracing::trace!(stream = self.stream.id(), bytes = total, "device copy-out");
        self.read_rows(&rows, dst)
    }

    /// Copy `src` to byte offset `offset` of a linear allocation.
    pub fn copy_in_linear(&mut self, src: &[u8], offset: usize) -> Result<()> {
        self.check_linear(offset, src.len())?;
        self.write_rows(&[(offset, src.len())], src)
    }

    /// Fill `dst` from byte offset `offset`.
    pub fn copy_out_linear(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.check_linear(offset, dst.len())?;
        let len = dst.len();
        self.read_rows(&[(offset, len)], dst)
    }

    fn check_linear(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.capacity {
            return Err(HaloError::SizeMismatch {
                expected: offset + len,
                found: self.capacity,
            });
        }
        Ok(())
    }

    fn write_rows(&mut self, rows: &[(usize, usize)], src: &[u8]) -> Result<()> {
        let Some(memory) = self.memory.as_mut() else {
            return Ok(());
        };
        match memory {
            DeviceMemory::Emulated(chunk) => {
                let mem = chunk.as_mut_slice();
                let mut packed = 0;
                for &(start, len) in rows {
                    mem[start..start + len].copy_from_slice(&src[packed..packed + len]);
                    packed += len;
                }
                Ok(())
            }
            DeviceMemory::Gpu(buffer) => {
                let Backend::Gpu(dev) = &self.ctx.backend else {
                    return Err(HaloError::Device("wgpu buffer on a non-wgpu context".into()));
                };
                let mut packed = 0;
                let pieces = rows.iter().map(|&(start, len)| {
                    let piece = (start, &src[packed..packed + len]);
                    packed += len;
                    piece
                });
                dev.write_rows(buffer, pieces)
            }
        }
    }

    fn read_rows(&self, rows: &[(usize, usize)], dst: &mut [u8]) -> Result<()> {
        let Some(memory) = self.memory.as_ref() else {
            return Ok(());
        };
        match memory {
            DeviceMemory::Emulated(chunk) => {
                let mem = chunk.as_slice();
                let mut packed = 0;
                for &(start, len) in rows {
                    dst[packed..packed + len].copy_from_slice(&mem[start..start + len]);
                    packed += len;
                }
                Ok(())
            }
            DeviceMemory::Gpu(buffer) => {
                let Backend::Gpu(dev) = &self.ctx.backend else {
                    return Err(HaloError::Device("wgpu buffer on a non-wgpu context".into()));
                };
                dev.read_rows(buffer, rows, dst)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_is_padded_to_alignment() {
        let ctx = DeviceContext::emulated();
        let mut buf = DeviceBuffer::new(ctx, 4);
        buf.allocate(3, IndexArray::new(5, 3, 2)).unwrap();
        assert_eq!(buf.pitch(), 64);
        assert_eq!(buf.capacity(), 64 * 6);
    }

    #[test]
    fn region_copy_round_trips_through_padding() {
        let ctx = DeviceContext::emulated();
        let mut buf = DeviceBuffer::new(ctx, 4);
        let size = IndexArray::new(4, 3, 2);
        buf.allocate(3, size).unwrap();
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        buf.copy_in_region(bytemuck::cast_slice(&values), &IndexArray::default(), &size)
            .unwrap();

        // Pull out the (1..3, 1..3, 1..2) block.
        let mut out = vec![0f32; 4];
        buf.copy_out_region(
            bytemuck::cast_slice_mut(&mut out),
            &IndexArray::new(1, 1, 1),
            &IndexArray::new(2, 2, 1),
        )
        .unwrap();
        assert_eq!(out, vec![17.0, 18.0, 21.0, 22.0]);
    }

    #[test]
    fn out_of_bounds_region_is_rejected() {
        let ctx = DeviceContext::emulated();
        let mut buf = DeviceBuffer::new(ctx, 4);
        buf.allocate(2, IndexArray::new(4, 4, 1)).unwrap();
        let mut out = vec![0u8; 64];
        let err = buf.copy_out_region(&mut out, &IndexArray::new(3, 0, 0), &IndexArray::new(2, 1, 1));
        assert!(matches!(err, Err(HaloError::Device(_))));
    }

    #[test]
    fn linear_capacity_only_grows() {
        let ctx = DeviceContext::emulated();
        let mut buf = DeviceBuffer::new(ctx, 8);
        buf.ensure_linear_capacity(128).unwrap();
        buf.copy_in_linear(&[7u8; 16], 8).unwrap();
        buf.ensure_linear_capacity(64).unwrap();
        assert_eq!(buf.capacity(), 128);
        let mut out = [0u8; 16];
        buf.copy_out_linear(&mut out, 8).unwrap();
        assert_eq!(out, [7u8; 16]);
    }

    #[test]
    fn streams_are_distinct() {
        let ctx = DeviceContext::emulated();
        let a = ctx.create_stream();
        let b = ctx.create_stream();
        assert_ne!(a, b);
        assert_ne!(a, Stream::DEFAULT);
        ctx.synchronize(a);
    }

    #[test]
    fn device_kind_parses() {
        assert_eq!("gpu".parse::<DeviceKind>().unwrap(), DeviceKind::Wgpu);
        assert_eq!("Emulated".parse::<DeviceKind>().unwrap(), DeviceKind::Emulated);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }
}
