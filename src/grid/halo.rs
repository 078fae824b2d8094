//! Halo staging and packing.
//!
//! Each (dimension, direction) slot moves data through four tiers:
//!
//! ```text
//! outgoing: device buffer -> self_stage (pinned) -> self_host (packed send buffer)
//! incoming: peer_stage (pinned receive) -> peer_dev (device)
//! ```
//!
//! Slot 0 of a dimension is the backward side: its self buffers carry the
//! far edge (sent to the forward neighbor, which stores it as its backward
//! halo) and its peer buffers hold the backward halo. Slot 1 mirrors this
//! for the forward side.

use std::sync::Arc;

use super::Grid;
use crate::buffer::{HostBuffer, PinnedBuffer};
use crate::device::{DeviceBuffer, DeviceContext};
use crate::error::{HaloError, Result};
use crate::index::{for_each_row, linear_offset, IndexArray};

pub struct HaloSlot {
    pub(crate) self_stage: PinnedBuffer,
    pub(crate) self_host: HostBuffer,
    pub(crate) peer_stage: PinnedBuffer,
    pub(crate) peer_dev: DeviceBuffer,
}

impl HaloSlot {
    pub(crate) fn new(ctx: &Arc<DeviceContext>, elm_size: usize) -> Self {
        Self {
            self_stage: PinnedBuffer::default(),
            self_host: HostBuffer::default(),
            peer_stage: PinnedBuffer::default(),
            peer_dev: DeviceBuffer::new(ctx.clone(), elm_size),
        }
    }
}

fn slot_index(forward: bool) -> usize {
    forward as usize
}

impl Grid {
    /// Extent of the halo of `dim` with the given width. For a diagonal halo
    /// the later dimensions include their recorded halo widths.
    pub fn halo_extent(&self, dim: usize, width: usize, diagonal: bool) -> IndexArray {
        let mut extent = self.local_size;
        extent[dim] = width as i64;
        if diagonal {
            for j in dim + 1..self.num_dims {
                extent[j] += (self.halo_bw_width[j] + self.halo_fw_width[j]) as i64;
            }
        }
        extent
    }

    /// Number of elements in the halo of `dim`.
    pub fn calc_halo_size(&self, dim: usize, width: usize, diagonal: bool) -> usize {
        self.halo_extent(dim, width, diagonal).accumulate(self.num_dims).max(0) as usize
    }

    pub(crate) fn set_halo_size(&mut self, dim: usize, forward: bool, width: usize, diagonal: bool) {
        let extent = self.halo_extent(dim, width, diagonal);
        if forward {
            self.halo_fw_width[dim] = width;
            self.halo_fw_size[dim] = extent;
        } else {
            self.halo_bw_width[dim] = width;
            self.halo_bw_size[dim] = extent;
        }
    }

    /// Mark the halo of `dim` on one side as absent.
    pub(crate) fn clear_halo(&mut self, dim: usize, forward: bool) {
        if forward {
            self.halo_fw_width[dim] = 0;
            self.halo_fw_size[dim] = IndexArray::default();
        } else {
            self.halo_bw_width[dim] = 0;
            self.halo_bw_size[dim] = IndexArray::default();
        }
    }

    fn halo_slots(&self, dim: usize) -> Result<&[HaloSlot; 2]> {
        self.halos.get(dim).ok_or(HaloError::NoBuffers(self.id))
    }

    pub(crate) fn halo_slots_mut(&mut self, dim: usize) -> Result<&mut [HaloSlot; 2]> {
        self.halos.get_mut(dim).ok_or(HaloError::NoBuffers(self.id))
    }

    fn check_halo_request(&self, dim: usize, width: usize, diagonal: bool) -> Result<()> {
        self.check_buffers()?;
        if diagonal && self.num_dims < 2 {
            return Err(HaloError::InvalidDiagonal {
                num_dims: self.num_dims,
            });
        }
        if width as i64 > self.local_size[dim] {
            return Err(HaloError::HaloTooWide {
                dim,
                width,
                local_offset: self.local_offset[dim],
                local_size: self.local_size[dim],
                rank: 0,
            });
        }
        Ok(())
    }

    /// Copy the `width` planes at one edge of `dim` from device memory into
    /// the pinned staging buffer. The forward slot takes the near edge, the
    /// backward slot the far edge.
    pub(crate) fn stage_halo(&mut self, dim: usize, width: usize, forward: bool) -> Result<()> {
        if self.empty {
            return Ok(());
        }
        self.check_halo_request(dim, width, false)?;
        let mut offset = IndexArray::default();
        if !forward {
            offset[dim] = self.local_size[dim] - width as i64;
        }
        let mut size = self.local_size;
        size[dim] = width as i64;
        let bytes = size.accumulate(self.num_dims) as usize * self.elm_size();

        let stage = &mut self.halos[dim][slot_index(forward)].self_stage;
        stage.ensure_capacity(bytes)?;
        let Some(buf) = self.data.get(self.current) else {
            return Ok(());
        };
        buf.copy_out_region(stage.prefix_mut(bytes)?, &offset, &size)
    }

    /// Assemble the packed send buffer from the staged planes. Returns its
    /// length in bytes.
    ///
    /// For a diagonal halo of any dimension but the last, the packed region
    /// also covers the recorded halos of every later dimension, so those
    /// halos must have been received first. Along each later dimension the
    /// data comes in the order backward corner, middle, forward corner.
    pub(crate) fn pack_halo(&mut self, dim: usize, width: usize, forward: bool, diagonal: bool) -> Result<usize> {
        if self.empty {
            return Ok(0);
        }
        self.check_halo_request(dim, width, diagonal)?;
        self.halo_has_diagonal = diagonal;
        let bytes = self.calc_halo_size(dim, width, diagonal) * self.elm_size();
        let idx = slot_index(forward);

        let mut out = std::mem::take(&mut self.halos[dim][idx].self_host);
        let packed = out
            .ensure_capacity(bytes)
            .and_then(|_| out.prefix_mut(bytes))
            .and_then(|dst| {
                if !diagonal || dim == self.num_dims - 1 {
                    dst.copy_from_slice(self.halos[dim][idx].self_stage.prefix(bytes)?);
                    Ok(())
                } else {
                    self.pack_diagonal(dim, width, forward, dst)
                }
            });
        self.halos[dim][idx].self_host = out;
        packed?;
        tracing::trace!(grid = self.id, dim, forward, bytes, diagonal, "halo packed");
        Ok(bytes)
    }

    fn pack_diagonal(&self, dim: usize, width: usize, forward: bool, dst: &mut [u8]) -> Result<()> {
        let nd = self.num_dims;
        let elm = self.elm_size();
        let ls = self.local_size;
        let bw = IndexArray::from_widths(&self.halo_bw_width);
        let edge = if forward { 0 } else { ls[dim] - width as i64 };

        // Region in local coordinates: [lo, lo + extent).
        let mut lo = IndexArray::default();
        lo[dim] = edge;
        for j in dim + 1..nd {
            lo[j] = -bw[j];
        }
        let extent = self.halo_extent(dim, width, true);
        let mut self_extent = ls;
        self_extent[dim] = width as i64;

        let stage = self.halos[dim][slot_index(forward)].self_stage.as_slice();
        let row = extent[0] as usize * elm;
        let mut pos = 0;
        let mut failure = None;
        for_each_row(&extent, nd, |r| {
            if failure.is_some() {
                return;
            }
            let mut q = lo + r;
            let (src, src_extent): (&[u8], IndexArray) = match (dim + 1..nd).find(|&j| q[j] < 0 || q[j] >= ls[j]) {
                None => {
                    q[dim] -= edge;
                    (stage, self_extent)
                }
                Some(j) => {
                    let backward = q[j] < 0;
                    if backward {
                        q[j] += bw[j];
                    } else {
                        q[j] -= ls[j];
                    }
                    for k in j + 1..nd {
                        q[k] += bw[k];
                    }
                    if backward {
                        (self.halos[j][0].peer_stage.as_slice(), self.halo_bw_size[j])
                    } else {
                        (self.halos[j][1].peer_stage.as_slice(), self.halo_fw_size[j])
                    }
                }
            };
            let start = linear_offset(&q, &src_extent, src_extent[0]) as usize * elm;
            match src.get(start..start + row) {
                Some(bytes) => {
                    dst[pos..pos + row].copy_from_slice(bytes);
                    pos += row;
                }
                None => {
                    failure = Some(HaloError::SizeMismatch {
                        expected: start + row,
                        found: src.len(),
                    })
                }
            }
        });
        failure.map_or(Ok(()), Err)
    }

    /// Stage and pack the halo of `dim` in one step. Returns the packed size
    /// in bytes.
    pub fn copyout_halo(&mut self, dim: usize, width: usize, forward: bool, diagonal: bool) -> Result<usize> {
        self.stage_halo(dim, width, forward)?;
        self.pack_halo(dim, width, forward, diagonal)
    }

    /// The packed send buffer filled by the last [`Grid::pack_halo`].
    pub fn packed_halo(&self, dim: usize, forward: bool, bytes: usize) -> Result<&[u8]> {
        self.halo_slots(dim)?[slot_index(forward)].self_host.prefix(bytes)
    }

    /// Record the incoming halo geometry and size the receive buffer.
    /// Returns the expected message length in bytes.
    pub(crate) fn prepare_peer_halo(&mut self, dim: usize, forward: bool, width: usize, diagonal: bool) -> Result<usize> {
        self.check_buffers()?;
        self.set_halo_size(dim, forward, width, diagonal);
        let bytes = self.calc_halo_size(dim, width, diagonal) * self.elm_size();
        self.halo_slots_mut(dim)?[slot_index(forward)].peer_stage.ensure_capacity(bytes)?;
        tracing::debug!(grid = self.id, dim, forward, width, bytes, "receiving halo");
        Ok(bytes)
    }

    /// Copy a received halo from the pinned receive buffer to device memory.
    pub(crate) fn commit_peer_halo(&mut self, dim: usize, forward: bool, bytes: usize) -> Result<()> {
        let slot = &mut self.halo_slots_mut(dim)?[slot_index(forward)];
        slot.peer_dev.ensure_linear_capacity(bytes)?;
        slot.peer_dev.copy_in_linear(slot.peer_stage.prefix(bytes)?, 0)
    }
}
