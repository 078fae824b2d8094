//! Fetching of arbitrary sub-rectangles owned by other ranks.
//!
//! A fetch is collective. Every rank sends each peer a [`FetchInfo`] naming
//! the part of the peer's partition it wants (possibly nothing), serves the
//! requests it receives from a space-level staging buffer, and copies the
//! replies into the grid's remote grid. The regular halo buffers are never
//! touched.

use bytemuck::{Pod, Zeroable};

use super::GridSpace;
use crate::comm::{tag, Incoming, Outgoing};
use crate::device::Stream;
use crate::error::{HaloError, Result};
use crate::grid::{Grid, GridId};
use crate::index::{intersect, IndexArray, WidthArray, MAX_DIMS};

/// Wire format of a fetch request: the box wanted from the receiving peer,
/// in global coordinates.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FetchInfo {
    pub peer_offset: [i64; MAX_DIMS],
    pub peer_size: [i64; MAX_DIMS],
}

impl FetchInfo {
    pub fn new(offset: IndexArray, size: IndexArray) -> Self {
        Self {
            peer_offset: offset.0,
            peer_size: size.0,
        }
    }

    pub fn offset(&self) -> IndexArray {
        IndexArray(self.peer_offset)
    }

    pub fn size(&self) -> IndexArray {
        IndexArray(self.peer_size)
    }

    pub fn is_empty(&self, num_dims: usize) -> bool {
        self.size().is_degenerate(num_dims)
    }
}

/// Halo widths covering the stencil offsets `[offset_min, offset_max]`.
fn widths_from_offsets(offset_min: &IndexArray, offset_max: &IndexArray) -> (WidthArray, WidthArray) {
    let mut fw = [0; MAX_DIMS];
    let mut bw = [0; MAX_DIMS];
    for d in 0..MAX_DIMS {
        fw[d] = offset_max[d].max(0) as usize;
        bw[d] = (-offset_min[d]).max(0) as usize;
    }
    (fw, bw)
}

/// Whether `[offset, offset + size)` lies inside the partition of `grid`.
fn within_partition(grid: &Grid, offset: &IndexArray, size: &IndexArray) -> bool {
    let nd = grid.num_dims();
    if size.is_degenerate(nd) {
        return true;
    }
    let lo = grid.local_offset();
    let ls = grid.local_size();
    (0..nd).all(|d| offset[d] >= lo[d] && offset[d] + size[d] <= lo[d] + ls[d])
}

/// Parameters of the last neighbor load of a grid. Identical on every rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct NeighborLoad {
    fw: WidthArray,
    bw: WidthArray,
    diagonal: bool,
    periodic: bool,
}

impl NeighborLoad {
    fn covers(&self, other: &NeighborLoad) -> bool {
        self.periodic == other.periodic
            && (self.diagonal || !other.diagonal)
            && (0..MAX_DIMS).all(|d| self.fw[d] >= other.fw[d] && self.bw[d] >= other.bw[d])
    }
}

impl GridSpace {
    /// Make `[offset, offset + size)` of grid `id` available on this rank.
    /// Collective: every rank calls it, each with its own box.
    ///
    /// Returns `None` if the box lies inside the local partition. Otherwise
    /// the box is assembled in the grid's remote grid, which becomes active
    /// and is returned.
    pub fn load_subgrid(&mut self, id: GridId, offset: IndexArray, size: IndexArray) -> Result<Option<&Grid>> {
        let _span = tracing::debug_span!("load_subgrid", grid = id, %offset, %size).entered();
        let me = self.rank;
        let num_ranks = self.comm.num_ranks();
        let grid = self.grids.get_mut(&id).ok_or(HaloError::UnknownGrid(id))?;
        let nd = grid.num_dims();
        let elm = grid.elm_size();
        let goff = grid.global_offset();
        let gsize = grid.size();
        let (req_off, req_size) = intersect(&offset, &size, &goff, &gsize);
        let local = within_partition(grid, &req_off, &req_size);

        let mut requests = vec![FetchInfo::default(); num_ranks];
        if !local {
            for (rank, o, s) in self.decomposition.owners(&req_off, &req_size, &goff, &gsize) {
                requests[rank] = FetchInfo::new(o, s);
            }
        }

        // Requests, all to all.
        let mut incoming = vec![FetchInfo::default(); num_ranks];
        {
            let sends: Vec<Outgoing<'_>> = (0..num_ranks)
                .filter(|&peer| peer != me)
                .map(|peer| Outgoing {
                    peer,
                    tag: tag::FETCH_REQUEST,
                    data: bytemuck::bytes_of(&requests[peer]),
                })
                .collect();
            let mut recvs: Vec<Incoming<'_>> = incoming
                .iter_mut()
                .enumerate()
                .filter(|(peer, _)| *peer != me)
                .map(|(peer, info)| Incoming {
                    peer,
                    tag: tag::FETCH_REQUEST,
                    buf: bytemuck::bytes_of_mut(info),
                })
                .collect();
            self.comm.exchange(&sends, &mut recvs)?;
        }

        // Stage what the peers asked for.
        let lo = grid.local_offset();
        let mut served = Vec::new();
        let mut total = 0;
        for (peer, info) in incoming.iter().enumerate() {
            if peer == me || info.is_empty(nd) {
                continue;
            }
            let bytes = info.size().accumulate(nd) as usize * elm;
            served.push((peer, total, bytes, *info));
            total += bytes;
        }
        self.fetch_buf.ensure_capacity(total)?;
        if let Some(buf) = grid.buffer() {
            for &(peer, start, bytes, info) in &served {
                tracing::trace!(grid = id, peer, offset = %info.offset(), size = %info.size(), "serving fetch");
                let dst = &mut self.fetch_buf.prefix_mut(total)?[start..start + bytes];
                buf.copy_out_region(dst, &(info.offset() - lo), &info.size())?;
            }
        } else if !served.is_empty() {
            return Err(HaloError::Comm(format!(
                "rank {me} asked for data of grid {id} it does not own"
            )));
        }

        // Replies, one per non-empty request.
        let mut replies: Vec<(usize, FetchInfo, Vec<u8>)> = requests
            .iter()
            .enumerate()
            .filter(|(peer, info)| *peer != me && !info.is_empty(nd))
            .map(|(peer, info)| (peer, *info, vec![0u8; info.size().accumulate(nd) as usize * elm]))
            .collect();
        {
            let staged = self.fetch_buf.prefix(total)?;
            let sends: Vec<Outgoing<'_>> = served
                .iter()
                .map(|&(peer, start, bytes, _)| Outgoing {
                    peer,
                    tag: tag::FETCH_REPLY,
                    data: &staged[start..start + bytes],
                })
                .collect();
            let mut recvs: Vec<Incoming<'_>> = replies
                .iter_mut()
                .map(|(peer, _, buf)| Incoming {
                    peer: *peer,
                    tag: tag::FETCH_REPLY,
                    buf: buf.as_mut_slice(),
                })
                .collect();
            self.comm.exchange(&sends, &mut recvs)?;
        }

        if local {
            grid.set_remote_grid_active(false);
            return Ok(None);
        }

        // Our own share comes straight from the local partition.
        let own = &requests[me];
        if !own.is_empty(nd) {
            let mut bytes = vec![0u8; own.size().accumulate(nd) as usize * elm];
            if let Some(buf) = grid.buffer() {
                buf.copy_out_region(&mut bytes, &(own.offset() - lo), &own.size())?;
            }
            replies.push((me, *own, bytes));
        }

        let remote = grid.ensure_remote_grid(req_off, req_size)?;
        if let Some(buf) = remote.buffer_mut() {
            for (peer, info, bytes) in &replies {
                tracing::trace!(grid = id, peer, offset = %info.offset(), "copying fetched region");
                buf.copy_in_region(bytes, &(info.offset() - req_off), &info.size())?;
            }
        }
        remote.refresh_descriptor();
        grid.set_remote_grid_active(true);
        tracing::debug!(grid = id, offset = %req_off, size = %req_size, parts = replies.len(), "subgrid loaded");
        Ok(grid.remote_grid())
    }

    /// Make the neighborhood `[offset_min, offset_max]` around every point of
    /// the local partition of grid `id` readable. Uses the regular halo
    /// exchange when every partition is wide enough to supply the halos, and
    /// falls back to [`GridSpace::load_subgrid`] otherwise. Returns the
    /// remote grid in the latter case.
    ///
    /// The fallback box is clipped to the grid and cannot wrap around, so a
    /// periodic load whose halos are too wide fails with `HaloTooWide` on
    /// every rank instead.
    ///
    /// With `reuse` set the caller asserts the grid is unchanged since the
    /// last load, and the exchange is skipped if that load covered the
    /// requested widths. Device copies go through `stream`.
    #[allow(clippy::too_many_arguments)]
    pub fn load_neighbor(
        &mut self,
        id: GridId,
        offset_min: &IndexArray,
        offset_max: &IndexArray,
        diagonal: bool,
        reuse: bool,
        periodic: bool,
        stream: Stream,
    ) -> Result<Option<&Grid>> {
        let (fw, bw) = widths_from_offsets(offset_min, offset_max);
        let request = NeighborLoad {
            fw,
            bw,
            diagonal,
            periodic,
        };
        if reuse && self.last_loads.get(&id).is_some_and(|last| last.covers(&request)) {
            tracing::debug!(grid = id, "reusing loaded halos");
            return Ok(None);
        }

        if self.halos_suffice(id, &fw, &bw, periodic)? {
            self.grid_mut(id)?.set_stream(stream);
            let outcome = self.exchange_boundaries(id, &fw, &bw, diagonal, periodic);
            let grid = self.grid_mut(id)?;
            grid.set_stream(Stream::DEFAULT);
            grid.set_remote_grid_active(false);
            outcome?;
            self.last_loads.insert(id, request);
            return Ok(None);
        }

        // Fall back to fetching the whole neighborhood box.
        let (offset, size) = {
            let grid = self.grid(id)?;
            let nd = grid.num_dims();
            if periodic {
                for d in 0..nd {
                    self.check_halo_widths(grid, d, fw[d], bw[d], true)?;
                }
            }
            let mut offset = grid.local_offset();
            let mut size = grid.local_size();
            for d in 0..nd {
                offset[d] -= bw[d] as i64;
                size[d] += (bw[d] + fw[d]) as i64;
            }
            if grid.is_empty() {
                size = IndexArray::default();
            }
            (offset, size)
        };
        self.last_loads.remove(&id);
        tracing::debug!(grid = id, %offset, %size, "halo too wide for exchange, fetching");
        self.load_subgrid(id, offset, size)
    }

    /// First half of a pipelined [`GridSpace::load_neighbor`]; see
    /// [`GridSpace::exchange_boundaries_stage1`].
    pub fn load_neighbor_stage1(
        &mut self,
        id: GridId,
        offset_min: &IndexArray,
        offset_max: &IndexArray,
        diagonal: bool,
        periodic: bool,
        stream: Stream,
    ) -> Result<()> {
        let (fw, bw) = widths_from_offsets(offset_min, offset_max);
        self.grid_mut(id)?.set_stream(stream);
        let outcome = self.exchange_boundaries_stage1(id, &fw, &bw, diagonal, periodic);
        self.grid_mut(id)?.set_stream(Stream::DEFAULT);
        outcome
    }

    /// Second half of a pipelined [`GridSpace::load_neighbor`].
    pub fn load_neighbor_stage2(
        &mut self,
        id: GridId,
        offset_min: &IndexArray,
        offset_max: &IndexArray,
        diagonal: bool,
        periodic: bool,
        stream: Stream,
    ) -> Result<()> {
        let (fw, bw) = widths_from_offsets(offset_min, offset_max);
        self.grid_mut(id)?.set_stream(stream);
        let outcome = self.exchange_boundaries_stage2(id, &fw, &bw, diagonal, periodic);
        let grid = self.grid_mut(id)?;
        grid.set_stream(Stream::DEFAULT);
        grid.set_remote_grid_active(false);
        outcome?;
        self.last_loads.insert(
            id,
            NeighborLoad {
                fw,
                bw,
                diagonal,
                periodic,
            },
        );
        Ok(())
    }

    /// Whether every partition of grid `id` can supply the halos.
    fn halos_suffice(&self, id: GridId, fw: &WidthArray, bw: &WidthArray, periodic: bool) -> Result<bool> {
        let grid = self.grid(id)?;
        Ok((0..grid.num_dims()).all(|d| self.first_too_wide(grid, d, fw[d], bw[d], periodic).is_none()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_from_stencil_offsets() {
        let (fw, bw) = widths_from_offsets(&IndexArray::new(-2, 0, 1), &IndexArray::new(1, 3, -1));
        assert_eq!(fw, [1, 3, 0]);
        assert_eq!(bw, [2, 0, 0]);
    }

    #[test]
    fn fetch_info_is_plain_bytes() {
        let info = FetchInfo::new(IndexArray::new(1, 2, 3), IndexArray::new(4, 5, 6));
        let bytes = bytemuck::bytes_of(&info);
        assert_eq!(bytes.len(), 48);
        assert_eq!(*bytemuck::from_bytes::<FetchInfo>(bytes), info);
        assert!(FetchInfo::default().is_empty(1));
    }

    #[test]
    fn wider_load_covers_narrower() {
        let wide = NeighborLoad {
            fw: [2, 2, 0],
            bw: [2, 1, 0],
            diagonal: true,
            periodic: false,
        };
        let narrow = NeighborLoad {
            fw: [1, 2, 0],
            bw: [0, 1, 0],
            diagonal: false,
            periodic: false,
        };
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(!wide.covers(&NeighborLoad { periodic: true, ..narrow }));
    }
}
