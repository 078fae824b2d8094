//! Distributed grid: one rank's partition of a global N-d array plus the
//! halo buffers mirroring its neighbors' boundary planes.
//!
//! Storage tiers per grid:
//! - the primary (optionally double-buffered) pitched device buffer holding
//!   the local partition;
//! - per (dimension, direction) a [`halo::HaloSlot`] with the outgoing
//!   staging buffers and the received peer halo.
//!
//! No raw pointers into any tier are cached. Element access goes through
//! [`Grid::get_address`], which returns an [`ElementLocation`] resolved
//! against the buffers as they are at the time of the call, and the
//! kernel-visible [`GridDescriptor`] is rebuilt by
//! [`Grid::refresh_descriptor`] whenever a buffer may have moved.

mod checkpoint;
pub(crate) mod halo;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceBuffer, DeviceContext, Stream};
use crate::element::{Element, ElementType, ReduceOp, Scalar};
use crate::error::{HaloError, Result};
use crate::index::{linear_offset, IndexArray, WidthArray, MAX_DIMS};

pub use halo::HaloSlot;

pub type GridId = i32;

/// Creation parameters of a grid, as passed by generated code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridShape {
    pub elm_type: ElementType,
    pub num_dims: usize,
    /// Global extent of the grid.
    pub size: IndexArray,
    /// Position of the grid's origin in the grid space.
    pub global_offset: IndexArray,
    pub double_buffering: bool,
    /// Opaque translator attributes.
    pub attr: i32,
}

impl GridShape {
    pub fn new(elm_type: ElementType, num_dims: usize, size: IndexArray) -> Self {
        Self {
            elm_type,
            num_dims,
            size,
            global_offset: IndexArray::default(),
            double_buffering: false,
            attr: 0,
        }
    }

    pub fn with_global_offset(mut self, offset: IndexArray) -> Self {
        self.global_offset = offset;
        self
    }

    pub fn with_double_buffering(mut self, enabled: bool) -> Self {
        self.double_buffering = enabled;
        self
    }

    pub fn num_elements(&self) -> i64 {
        self.size.accumulate(self.num_dims)
    }
}

/// Device-visible view of a grid, laid out for direct upload as a uniform.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GridDescriptor {
    pub dim: [u32; MAX_DIMS],
    pub local_size: [u32; MAX_DIMS],
    pub local_offset: [i32; MAX_DIMS],
    pub halo_bw_width: [u32; MAX_DIMS],
    pub halo_fw_width: [u32; MAX_DIMS],
    /// Row pitch of the primary buffer in elements.
    pub pitch: u32,
    pub diag: u32,
    pub num_dims: u32,
}

/// Which storage tier an element lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// The current primary buffer.
    Local,
    /// The backward peer halo of the given dimension.
    BackwardHalo(usize),
    /// The forward peer halo of the given dimension.
    ForwardHalo(usize),
    /// The partition is empty and owns no storage.
    Unbacked,
}

/// Resolved position of one element: a tier and a byte offset within it.
///
/// Valid until the next exchange or reallocation of the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementLocation {
    pub tier: Tier,
    pub offset: usize,
}

pub struct Grid {
    id: GridId,
    elm_type: ElementType,
    num_dims: usize,
    size: IndexArray,
    global_offset: IndexArray,
    local_offset: IndexArray,
    local_size: IndexArray,
    double_buffering: bool,
    attr: i32,
    empty: bool,
    ctx: Arc<DeviceContext>,
    data: Vec<DeviceBuffer>,
    current: usize,
    pub(crate) halos: Vec<[HaloSlot; 2]>,
    pub(crate) halo_bw_width: WidthArray,
    pub(crate) halo_fw_width: WidthArray,
    pub(crate) halo_bw_size: [IndexArray; MAX_DIMS],
    pub(crate) halo_fw_size: [IndexArray; MAX_DIMS],
    pub(crate) halo_has_diagonal: bool,
    remote_grid: Option<Box<Grid>>,
    remote_grid_active: bool,
    descriptor: GridDescriptor,
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("id", &self.id)
            .field("elm_type", &self.elm_type)
            .field("size", &self.size)
            .field("global_offset", &self.global_offset)
            .field("local_offset", &self.local_offset)
            .field("local_size", &self.local_size)
            .finish()
    }
}

impl Grid {
    /// Create the local part `[local_offset, local_offset + local_size)` of a
    /// grid. Nothing is allocated when the partition is empty.
    pub fn create(
        id: GridId,
        shape: &GridShape,
        local_offset: IndexArray,
        local_size: IndexArray,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let nd = shape.num_dims;
        if nd == 0 || nd > MAX_DIMS {
            return Err(HaloError::UnsupportedDimensions(nd));
        }
        let mut grid = Grid {
            id,
            elm_type: shape.elm_type,
            num_dims: nd,
            size: IndexArray::from_slice(&shape.size.0[..nd], 1),
            global_offset: IndexArray::from_slice(&shape.global_offset.0[..nd], 0),
            local_offset: IndexArray::from_slice(&local_offset.0[..nd], 0),
            local_size: IndexArray::from_slice(&local_size.0[..nd], 1),
            double_buffering: shape.double_buffering,
            attr: shape.attr,
            empty: local_size.is_degenerate(nd),
            ctx,
            data: Vec::new(),
            current: 0,
            halos: Vec::new(),
            halo_bw_width: [0; MAX_DIMS],
            halo_fw_width: [0; MAX_DIMS],
            halo_bw_size: [IndexArray::default(); MAX_DIMS],
            halo_fw_size: [IndexArray::default(); MAX_DIMS],
            halo_has_diagonal: false,
            remote_grid: None,
            remote_grid_active: false,
            descriptor: GridDescriptor::default(),
        };
        grid.init_buffers()?;
        Ok(grid)
    }

    pub(crate) fn init_buffers(&mut self) -> Result<()> {
        if self.empty {
            self.refresh_descriptor();
            return Ok(());
        }
        tracing::debug!(grid = self.id, local_size = %self.local_size, "initializing grid buffers");
        let copies = if self.double_buffering { 2 } else { 1 };
        self.data.clear();
        for _ in 0..copies {
            let mut buf = DeviceBuffer::new(self.ctx.clone(), self.elm_size());
            buf.allocate(self.num_dims, self.local_size)?;
            self.data.push(buf);
        }
        self.current = 0;
        self.halos = (0..self.num_dims)
            .map(|_| {
                [
                    HaloSlot::new(&self.ctx, self.elm_size()),
                    HaloSlot::new(&self.ctx, self.elm_size()),
                ]
            })
            .collect();
        self.refresh_descriptor();
        Ok(())
    }

    pub(crate) fn delete_buffers(&mut self) {
        self.data.clear();
        self.halos.clear();
        self.halo_bw_width = [0; MAX_DIMS];
        self.halo_fw_width = [0; MAX_DIMS];
        self.halo_bw_size = [IndexArray::default(); MAX_DIMS];
        self.halo_fw_size = [IndexArray::default(); MAX_DIMS];
        self.refresh_descriptor();
    }

    pub fn id(&self) -> GridId {
        self.id
    }

    pub fn elm_type(&self) -> ElementType {
        self.elm_type
    }

    pub fn elm_size(&self) -> usize {
        self.elm_type.size()
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn size(&self) -> IndexArray {
        self.size
    }

    pub fn global_offset(&self) -> IndexArray {
        self.global_offset
    }

    pub fn local_offset(&self) -> IndexArray {
        self.local_offset
    }

    pub fn local_size(&self) -> IndexArray {
        self.local_size
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn double_buffering(&self) -> bool {
        self.double_buffering
    }

    pub fn attr(&self) -> i32 {
        self.attr
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn halo_bw_width(&self) -> WidthArray {
        self.halo_bw_width
    }

    pub fn halo_fw_width(&self) -> WidthArray {
        self.halo_fw_width
    }

    pub fn halo_has_diagonal(&self) -> bool {
        self.halo_has_diagonal
    }

    pub fn descriptor(&self) -> &GridDescriptor {
        &self.descriptor
    }

    /// Shape this grid was created with, for building sibling grids.
    pub fn shape(&self) -> GridShape {
        GridShape {
            elm_type: self.elm_type,
            num_dims: self.num_dims,
            size: self.size,
            global_offset: self.global_offset,
            double_buffering: self.double_buffering,
            attr: self.attr,
        }
    }

    /// Number of elements in the local partition.
    pub fn num_elements(&self) -> usize {
        if self.empty {
            0
        } else {
            self.local_size.accumulate(self.num_dims) as usize
        }
    }

    /// Bytes of the local partition when packed.
    pub fn local_bytes(&self) -> usize {
        self.num_elements() * self.elm_size()
    }

    /// The global position `index` belongs to this rank's partition.
    pub fn is_local(&self, index: &IndexArray) -> bool {
        !self.empty && self.local_offset.contains(&self.local_size, index, self.num_dims)
    }

    /// Index of the current buffer (0 or 1).
    pub fn current_buffer(&self) -> usize {
        self.current
    }

    /// Exchange the roles of the two buffers of a double-buffered grid.
    pub fn swap_buffers(&mut self) {
        if self.data.len() == 2 {
            self.current ^= 1;
            self.refresh_descriptor();
        }
    }

    /// Fail if the grid's buffers were released by [`Grid::save`].
    /// Empty partitions never hold buffers and always pass.
    pub(crate) fn check_buffers(&self) -> Result<()> {
        if !self.empty && self.data.is_empty() {
            return Err(HaloError::NoBuffers(self.id));
        }
        Ok(())
    }

    pub(crate) fn buffer(&self) -> Option<&DeviceBuffer> {
        self.data.get(self.current)
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut DeviceBuffer> {
        self.data.get_mut(self.current)
    }

    /// Route all device copies of this grid through `stream`.
    pub fn set_stream(&mut self, stream: Stream) {
        for buf in &mut self.data {
            buf.set_stream(stream);
        }
        for slot in self.halos.iter_mut().flatten() {
            slot.peer_dev.set_stream(stream);
        }
    }

    /// Rebuild the kernel-visible descriptor from the current buffers.
    pub fn refresh_descriptor(&mut self) {
        let mut d = GridDescriptor {
            num_dims: self.num_dims as u32,
            diag: self.halo_has_diagonal as u32,
            ..Default::default()
        };
        if let Some(buf) = self.buffer() {
            d.pitch = (buf.pitch() / self.elm_size()) as u32;
        }
        for i in 0..self.num_dims {
            d.dim[i] = self.size[i] as u32;
            d.local_size[i] = self.local_size[i] as u32;
            d.local_offset[i] = self.local_offset[i] as i32;
            d.halo_bw_width[i] = self.halo_bw_width[i] as u32;
            d.halo_fw_width[i] = self.halo_fw_width[i] as u32;
        }
        if d != self.descriptor {
            tracing::debug!(grid = self.id, pitch = d.pitch, diag = d.diag, "descriptor refreshed");
        }
        self.descriptor = d;
    }

    /// Copy a packed array of the whole local partition into the current buffer.
    pub fn copyin_local(&mut self, src: &[u8]) -> Result<()> {
        if self.empty {
            return Ok(());
        }
        let expected = self.local_bytes();
        if src.len() != expected {
            return Err(HaloError::SizeMismatch {
                expected,
                found: src.len(),
            });
        }
        let size = self.local_size;
        match self.buffer_mut() {
            Some(buf) => buf.copy_in_region(src, &IndexArray::default(), &size),
            None => Err(HaloError::NoBuffers(self.id)),
        }
    }

    /// Copy the current buffer's local partition out into a packed array.
    pub fn copyout_local(&self, dst: &mut [u8]) -> Result<()> {
        if self.empty {
            return Ok(());
        }
        let expected = self.local_bytes();
        if dst.len() != expected {
            return Err(HaloError::SizeMismatch {
                expected,
                found: dst.len(),
            });
        }
        match self.buffer() {
            Some(buf) => buf.copy_out_region(dst, &IndexArray::default(), &self.local_size),
            None => Err(HaloError::NoBuffers(self.id)),
        }
    }

    /// Typed convenience wrapper around [`Grid::copyin_local`].
    pub fn copyin_local_typed<T: Element>(&mut self, src: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        self.copyin_local(bytemuck::cast_slice(src))
    }

    /// Typed convenience wrapper around [`Grid::copyout_local`].
    pub fn copyout_local_typed<T: Element>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        let mut out = vec![T::zeroed(); self.num_elements()];
        self.copyout_local(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::TYPE != self.elm_type {
            return Err(HaloError::TypeMismatch {
                expected: self.elm_type.name(),
                found: T::TYPE.name(),
            });
        }
        Ok(())
    }

    /// Resolve the global position `index` to the tier holding it.
    ///
    /// Positions inside the local partition resolve to the current buffer.
    /// A position outside the partition in exactly one dimension resolves to
    /// that dimension's peer halo. Positions outside in several dimensions
    /// (corners) resolve only if the last exchange was diagonal; the first
    /// out-of-range dimension then selects the halo, whose extent covers the
    /// halos of every later dimension. Anything the received halos do not
    /// cover is `OutOfHalo`.
    pub fn get_address(&self, index: &IndexArray) -> Result<ElementLocation> {
        if self.remote_grid_active {
            return Err(HaloError::RemoteGridActive(self.id));
        }
        self.check_buffers()?;
        if self.empty {
            return Ok(ElementLocation {
                tier: Tier::Unbacked,
                offset: 0,
            });
        }
        let nd = self.num_dims;
        let mut p = IndexArray::from_slice(&index.0[..nd], 0) - self.local_offset;
        let elm = self.elm_size() as i64;

        let Some(i) = (0..nd).find(|&i| p[i] < 0 || p[i] >= self.local_size[i]) else {
            let pitch = self.buffer().map_or(0, |b| b.pitch()) as i64 / elm;
            let offset = linear_offset(&p, &self.local_size, pitch) * elm;
            return Ok(ElementLocation {
                tier: Tier::Local,
                offset: offset as usize,
            });
        };

        let out_of_halo = || HaloError::OutOfHalo { index: *index, dim: i };
        if self.halo_has_diagonal {
            for j in i + 1..nd {
                p[j] += self.halo_bw_width[j] as i64;
            }
        }
        let (tier, extent) = if p[i] < 0 {
            p[i] += self.halo_bw_width[i] as i64;
            (Tier::BackwardHalo(i), self.halo_bw_size[i])
        } else {
            p[i] -= self.local_size[i];
            (Tier::ForwardHalo(i), self.halo_fw_size[i])
        };
        if !(0..nd).all(|k| p[k] >= 0 && p[k] < extent[k]) {
            return Err(out_of_halo());
        }
        let offset = linear_offset(&p, &extent, extent[0]) * elm;
        Ok(ElementLocation {
            tier,
            offset: offset as usize,
        })
    }

    /// Read the element at global position `index`.
    pub fn read_element<T: Element>(&self, index: &IndexArray) -> Result<T> {
        self.check_type::<T>()?;
        let loc = self.get_address(index)?;
        let mut value = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut value);
        match loc.tier {
            Tier::Unbacked => {}
            Tier::Local => {
                if let Some(buf) = self.buffer() {
                    buf.copy_out_linear(bytes, loc.offset)?;
                }
            }
            Tier::BackwardHalo(d) => self.halos[d][0].peer_dev.copy_out_linear(bytes, loc.offset)?,
            Tier::ForwardHalo(d) => self.halos[d][1].peer_dev.copy_out_linear(bytes, loc.offset)?,
        }
        Ok(value)
    }

    /// Write the element at global position `index`. Writes to an empty
    /// partition are dropped.
    pub fn write_element<T: Element>(&mut self, index: &IndexArray, value: T) -> Result<()> {
        self.check_type::<T>()?;
        let loc = self.get_address(index)?;
        let bytes = bytemuck::bytes_of(&value);
        match loc.tier {
            Tier::Unbacked => Ok(()),
            Tier::Local => match self.buffer_mut() {
                Some(buf) => buf.copy_in_linear(bytes, loc.offset),
                None => Ok(()),
            },
            Tier::BackwardHalo(d) => self.halos[d][0].peer_dev.copy_in_linear(bytes, loc.offset),
            Tier::ForwardHalo(d) => self.halos[d][1].peer_dev.copy_in_linear(bytes, loc.offset),
        }
    }

    /// Change the local partition. Buffers are reallocated only if the
    /// extent changes; contents are not preserved in that case.
    pub fn resize(&mut self, local_offset: IndexArray, local_size: IndexArray) -> Result<()> {
        let nd = self.num_dims;
        let local_offset = IndexArray::from_slice(&local_offset.0[..nd], 0);
        let local_size = IndexArray::from_slice(&local_size.0[..nd], 1);
        self.local_offset = local_offset;
        if local_size == self.local_size && self.empty == local_size.is_degenerate(nd) {
            self.refresh_descriptor();
            return Ok(());
        }
        self.delete_buffers();
        self.local_size = local_size;
        self.empty = local_size.is_degenerate(nd);
        self.init_buffers()
    }

    /// Get the auxiliary grid used for fetched sub-regions, creating it or
    /// resizing it in place to cover `[local_offset, local_offset + local_size)`.
    pub fn ensure_remote_grid(&mut self, local_offset: IndexArray, local_size: IndexArray) -> Result<&mut Grid> {
        if let Some(rg) = self.remote_grid.as_deref_mut() {
            rg.resize(local_offset, local_size)?;
        } else {
            let shape = GridShape {
                double_buffering: false,
                attr: 0,
                ..self.shape()
            };
            let rg = Grid::create(self.id, &shape, local_offset, local_size, self.ctx.clone())?;
            self.remote_grid = Some(Box::new(rg));
        }
        match self.remote_grid.as_deref_mut() {
            Some(rg) => Ok(rg),
            None => Err(HaloError::UnknownGrid(self.id)),
        }
    }

    pub fn remote_grid(&self) -> Option<&Grid> {
        self.remote_grid.as_deref()
    }

    pub fn remote_grid_active(&self) -> bool {
        self.remote_grid_active
    }

    /// While active, element access must go through the remote grid.
    pub fn set_remote_grid_active(&mut self, active: bool) {
        self.remote_grid_active = active;
    }

    /// Reduce the local partition. `None` if the partition is empty.
    pub fn reduce_local(&self, op: ReduceOp) -> Result<Option<Scalar>> {
        if self.empty {
            return Ok(None);
        }
        let mut bytes = vec![0u8; self.local_bytes()];
        self.copyout_local(&mut bytes)?;
        op.fold(self.elm_type, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_3d(local_size: IndexArray) -> Grid {
        let shape = GridShape::new(ElementType::Float, 3, IndexArray::new(8, 8, 8));
        Grid::create(1, &shape, IndexArray::new(4, 0, 0), local_size, DeviceContext::emulated()).unwrap()
    }

    #[test]
    fn copyin_copyout_round_trip() {
        let mut g = grid_3d(IndexArray::new(4, 3, 2));
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        g.copyin_local_typed(&values).unwrap();
        assert_eq!(g.copyout_local_typed::<f32>().unwrap(), values);
    }

    #[test]
    fn local_addressing_honors_pitch() {
        let mut g = grid_3d(IndexArray::new(4, 3, 2));
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        g.copyin_local_typed(&values).unwrap();
        // Global (5, 2, 1) is local (1, 2, 1) = 1 + 2*4 + 1*12.
        let v: f32 = g.read_element(&IndexArray::new(5, 2, 1)).unwrap();
        assert_eq!(v, 21.0);
        let loc = g.get_address(&IndexArray::new(5, 2, 1)).unwrap();
        assert_eq!(loc.tier, Tier::Local);
        // 16 floats per padded row.
        assert_eq!(loc.offset, (1 + 2 * 16 + 16 * 3) * 4);
        assert_eq!(g.descriptor().pitch, 16);
    }

    #[test]
    fn write_then_read_element() {
        let mut g = grid_3d(IndexArray::new(4, 3, 2));
        g.write_element(&IndexArray::new(7, 2, 1), 3.5f32).unwrap();
        assert_eq!(g.read_element::<f32>(&IndexArray::new(7, 2, 1)).unwrap(), 3.5);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let g = grid_3d(IndexArray::new(4, 3, 2));
        assert!(matches!(
            g.read_element::<f64>(&IndexArray::new(4, 0, 0)),
            Err(HaloError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn access_outside_unexchanged_halo_fails() {
        let g = grid_3d(IndexArray::new(4, 3, 2));
        assert!(matches!(
            g.get_address(&IndexArray::new(3, 0, 0)),
            Err(HaloError::OutOfHalo { dim: 0, .. })
        ));
    }

    #[test]
    fn empty_partition_allocates_nothing() {
        let mut g = grid_3d(IndexArray::new(4, 0, 2));
        assert!(g.is_empty());
        assert_eq!(g.num_elements(), 0);
        assert!(g.buffer().is_none());
        g.copyin_local(&[]).unwrap();
        assert_eq!(g.get_address(&IndexArray::new(4, 0, 0)).unwrap().tier, Tier::Unbacked);
        assert_eq!(g.read_element::<f32>(&IndexArray::new(4, 0, 0)).unwrap(), 0.0);
        assert_eq!(g.reduce_local(ReduceOp::Sum).unwrap(), None);
    }

    #[test]
    fn double_buffers_swap() {
        let shape = GridShape::new(ElementType::Int, 1, IndexArray::new(4, 1, 1)).with_double_buffering(true);
        let mut g = Grid::create(2, &shape, IndexArray::default(), IndexArray::new(4, 1, 1), DeviceContext::emulated())
            .unwrap();
        g.copyin_local_typed(&[1i32, 2, 3, 4]).unwrap();
        g.swap_buffers();
        assert_eq!(g.current_buffer(), 1);
        assert_eq!(g.copyout_local_typed::<i32>().unwrap(), vec![0, 0, 0, 0]);
        g.swap_buffers();
        assert_eq!(g.copyout_local_typed::<i32>().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn remote_grid_is_reused() {
        let mut g = grid_3d(IndexArray::new(4, 3, 2));
        g.ensure_remote_grid(IndexArray::new(0, 0, 0), IndexArray::new(2, 2, 2)).unwrap();
        let rg = g.ensure_remote_grid(IndexArray::new(2, 2, 2), IndexArray::new(2, 2, 2)).unwrap();
        assert_eq!(rg.local_offset(), IndexArray::new(2, 2, 2));
        assert_eq!(rg.num_elements(), 8);
        g.set_remote_grid_active(true);
        assert!(matches!(g.get_address(&IndexArray::new(4, 0, 0)), Err(HaloError::RemoteGridActive(1))));
    }

    #[test]
    fn local_reduction() {
        let mut g = grid_3d(IndexArray::new(2, 2, 1));
        g.copyin_local_typed(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(g.reduce_local(ReduceOp::Sum).unwrap(), Some(Scalar::F32(10.0)));
        assert_eq!(g.reduce_local(ReduceOp::Min).unwrap(), Some(Scalar::F32(1.0)));
    }

    #[test]
    fn unsupported_dimension_count() {
        let shape = GridShape::new(ElementType::Float, 4, IndexArray::splat(2));
        let err = Grid::create(0, &shape, IndexArray::default(), IndexArray::splat(2), DeviceContext::emulated());
        assert!(matches!(err, Err(HaloError::UnsupportedDimensions(4))));
    }
}
