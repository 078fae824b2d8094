//! Halo exchange between neighboring partitions.
//!
//! Per dimension, a rank sends the `bw_width` planes at its far edge to the
//! forward neighbor (which stores them as its backward halo) and the
//! `fw_width` planes at its near edge to the backward neighbor. All sends
//! are posted, then the backward halo is received, then the forward halo,
//! then the sends are waited on.
//!
//! Dimensions are exchanged from the last down to the first, so with
//! `diagonal` set the halo of each dimension can carry the corners taken
//! from the already received halos of the later dimensions.

use super::GridSpace;
use crate::comm::{tag, CommunicationBackend, Incoming, Outgoing};
use crate::error::{HaloError, Result};
use crate::grid::{Grid, GridId};
use crate::index::WidthArray;
use crate::profile::{GridProfile, Stopwatch};

/// The directions of one dimension's exchange that are active on this rank.
/// Each field holds the peer rank when the transfer takes place.
#[derive(Clone, Copy, Debug)]
pub(super) struct DimPlan {
    pub dim: usize,
    pub fw_width: usize,
    pub bw_width: usize,
    pub diagonal: bool,
    /// Receiver of our far edge (`bw_width` planes).
    pub far_edge_to: Option<usize>,
    /// Receiver of our near edge (`fw_width` planes).
    pub near_edge_to: Option<usize>,
    pub bw_halo_from: Option<usize>,
    pub fw_halo_from: Option<usize>,
}

impl GridSpace {
    /// Exchange the halos of every dimension of grid `id`. Widths are per
    /// dimension; a zero width skips that direction.
    pub fn exchange_boundaries(
        &mut self,
        id: GridId,
        fw: &WidthArray,
        bw: &WidthArray,
        diagonal: bool,
        periodic: bool,
    ) -> Result<()> {
        let nd = self.grid(id)?.num_dims();
        let _span = tracing::debug_span!("exchange_boundaries", grid = id, diagonal, periodic).entered();
        for dim in (0..nd).rev() {
            self.exchange_boundaries_dim(id, dim, fw[dim], bw[dim], diagonal, periodic)?;
        }
        Ok(())
    }

    /// Exchange the halos of a single dimension. Returns only after both
    /// directions have been sent and received.
    pub fn exchange_boundaries_dim(
        &mut self,
        id: GridId,
        dim: usize,
        fw_width: usize,
        bw_width: usize,
        diagonal: bool,
        periodic: bool,
    ) -> Result<()> {
        let Some(plan) = self.plan_exchange(id, dim, fw_width, bw_width, diagonal, periodic)? else {
            return Ok(());
        };
        let _span = tracing::debug_span!("exchange_dim", grid = id, dim).entered();
        let comm = self.comm.clone();
        let (grid, prof) = self.grid_and_profile(id)?;
        grid.halo_has_diagonal = diagonal;
        stage_outgoing(grid, prof, &plan)?;
        pack_outgoing(grid, prof, &plan)?;
        transfer(comm.as_ref(), grid, prof, &plan)
    }

    /// First half of a two-stage exchange: stage the outgoing halos of every
    /// dimension but the last into host memory. Straight halos are packed
    /// here as well; diagonal ones depend on halos received in stage 2 and
    /// are packed there.
    ///
    /// Must be followed by [`GridSpace::exchange_boundaries_stage2`] with the
    /// same arguments before the grid is modified.
    pub fn exchange_boundaries_stage1(
        &mut self,
        id: GridId,
        fw: &WidthArray,
        bw: &WidthArray,
        diagonal: bool,
        periodic: bool,
    ) -> Result<()> {
        let nd = self.grid(id)?.num_dims();
        let _span = tracing::debug_span!("exchange_stage1", grid = id).entered();
        for dim in (0..nd.saturating_sub(1)).rev() {
            let Some(plan) = self.plan_exchange(id, dim, fw[dim], bw[dim], diagonal, periodic)? else {
                continue;
            };
            let (grid, prof) = self.grid_and_profile(id)?;
            stage_outgoing(grid, prof, &plan)?;
            if !diagonal {
                pack_outgoing(grid, prof, &plan)?;
            }
        }
        Ok(())
    }

    /// Second half of a two-stage exchange: exchange the last dimension in
    /// full, then send and receive the halos staged by stage 1.
    pub fn exchange_boundaries_stage2(
        &mut self,
        id: GridId,
        fw: &WidthArray,
        bw: &WidthArray,
        diagonal: bool,
        periodic: bool,
    ) -> Result<()> {
        let nd = self.grid(id)?.num_dims();
        let _span = tracing::debug_span!("exchange_stage2", grid = id).entered();
        let last = nd - 1;
        self.exchange_boundaries_dim(id, last, fw[last], bw[last], diagonal, periodic)?;
        let comm = self.comm.clone();
        for dim in (0..last).rev() {
            let Some(plan) = self.plan_exchange(id, dim, fw[dim], bw[dim], diagonal, periodic)? else {
                continue;
            };
            let (grid, prof) = self.grid_and_profile(id)?;
            grid.halo_has_diagonal = diagonal;
            if diagonal {
                pack_outgoing(grid, prof, &plan)?;
            }
            transfer(comm.as_ref(), grid, prof, &plan)?;
        }
        Ok(())
    }

    /// Work out which transfers of one dimension's exchange this rank takes
    /// part in. `None` if the local partition is empty.
    pub(super) fn plan_exchange(
        &self,
        id: GridId,
        dim: usize,
        fw_width: usize,
        bw_width: usize,
        diagonal: bool,
        periodic: bool,
    ) -> Result<Option<DimPlan>> {
        let grid = self.grid(id)?;
        if diagonal && grid.num_dims() < 2 {
            return Err(HaloError::InvalidDiagonal {
                num_dims: grid.num_dims(),
            });
        }
        self.check_halo_widths(grid, dim, fw_width, bw_width, periodic)?;
        grid.check_buffers()?;
        if grid.is_empty() {
            return Ok(None);
        }

        let goff = grid.global_offset();
        let gsize = grid.size();
        let lo = grid.local_offset()[dim];
        let hi = lo + grid.local_size()[dim];
        let open_bw = periodic || lo != goff[dim];
        let open_fw = periodic || hi != goff[dim] + gsize[dim];
        let fw_peer = self
            .decomposition
            .neighbor(&self.coords, dim, true, periodic, &goff, &gsize)
            .filter(|_| open_fw);
        let bw_peer = self
            .decomposition
            .neighbor(&self.coords, dim, false, periodic, &goff, &gsize)
            .filter(|_| open_bw);

        let plan = DimPlan {
            dim,
            fw_width,
            bw_width,
            diagonal,
            far_edge_to: fw_peer.filter(|_| bw_width > 0),
            near_edge_to: bw_peer.filter(|_| fw_width > 0),
            bw_halo_from: bw_peer.filter(|_| bw_width > 0),
            fw_halo_from: fw_peer.filter(|_| fw_width > 0),
        };
        tracing::trace!(grid = id, ?plan, "exchange plan");
        Ok(Some(plan))
    }

    /// Reject halo widths that exceed the partition supplying them. The
    /// check covers every process coordinate along `dim`, so all ranks reach
    /// the same verdict.
    pub(super) fn check_halo_widths(&self, grid: &Grid, dim: usize, fw_width: usize, bw_width: usize, periodic: bool) -> Result<()> {
        match self.first_too_wide(grid, dim, fw_width, bw_width, periodic) {
            Some((coord, width, lo, n)) => {
                let mut coords = self.coords;
                coords[dim] = coord;
                Err(HaloError::HaloTooWide {
                    dim,
                    width,
                    local_offset: lo,
                    local_size: n,
                    rank: self.decomposition.procs().rank_of(&coords),
                })
            }
            None => Ok(()),
        }
    }

    /// First process coordinate along `dim` whose partition is narrower
    /// than a halo it has to supply, as `(coord, width, offset, size)`.
    pub(super) fn first_too_wide(
        &self,
        grid: &Grid,
        dim: usize,
        fw_width: usize,
        bw_width: usize,
        periodic: bool,
    ) -> Option<(usize, usize, i64, i64)> {
        let goff = grid.global_offset();
        let gsize = grid.size();
        (0..self.decomposition.procs().extent(dim)).find_map(|k| {
            let (lo, n) = self.decomposition.grid_range(dim, k, &goff, &gsize);
            if n == 0 {
                return None;
            }
            let first = lo == goff[dim];
            let last = lo + n == goff[dim] + gsize[dim];
            if bw_width as i64 > n && (periodic || !last) {
                return Some((k, bw_width, lo, n));
            }
            if fw_width as i64 > n && (periodic || !first) {
                return Some((k, fw_width, lo, n));
            }
            None
        })
    }
}

/// Copy the outgoing edge planes from device memory to the pinned staging
/// buffers.
fn stage_outgoing(grid: &mut Grid, prof: &mut GridProfile, plan: &DimPlan) -> Result<()> {
    let dim = plan.dim;
    let mut sw = Stopwatch::new();
    if plan.far_edge_to.is_some() {
        sw.start();
        grid.stage_halo(dim, plan.bw_width, false)?;
        prof.upward_mut(dim).gpu_to_cpu += sw.stop();
    }
    if plan.near_edge_to.is_some() {
        sw.start();
        grid.stage_halo(dim, plan.fw_width, true)?;
        prof.downward_mut(dim).gpu_to_cpu += sw.stop();
    }
    Ok(())
}

/// Assemble the send buffers from the staged planes.
fn pack_outgoing(grid: &mut Grid, prof: &mut GridProfile, plan: &DimPlan) -> Result<()> {
    let dim = plan.dim;
    let mut sw = Stopwatch::new();
    if plan.far_edge_to.is_some() {
        sw.start();
        grid.pack_halo(dim, plan.bw_width, false, plan.diagonal)?;
        prof.upward_mut(dim).cpu_out += sw.stop();
    }
    if plan.near_edge_to.is_some() {
        sw.start();
        grid.pack_halo(dim, plan.fw_width, true, plan.diagonal)?;
        prof.downward_mut(dim).cpu_out += sw.stop();
    }
    Ok(())
}

/// Send the packed halos, receive the peers' halos and copy them to the
/// device. Directions without a peer leave their halo recorded as absent.
fn transfer(comm: &dyn CommunicationBackend, grid: &mut Grid, prof: &mut GridProfile, plan: &DimPlan) -> Result<()> {
    let dim = plan.dim;
    let elm = grid.elm_size();
    let far_bytes = grid.calc_halo_size(dim, plan.bw_width, plan.diagonal) * elm;
    let near_bytes = grid.calc_halo_size(dim, plan.fw_width, plan.diagonal) * elm;

    let bw_bytes = match plan.bw_halo_from {
        Some(_) => grid.prepare_peer_halo(dim, false, plan.bw_width, plan.diagonal)?,
        None => {
            grid.clear_halo(dim, false);
            0
        }
    };
    let fw_bytes = match plan.fw_halo_from {
        Some(_) => grid.prepare_peer_halo(dim, true, plan.fw_width, plan.diagonal)?,
        None => {
            grid.clear_halo(dim, true);
            0
        }
    };

    let times = {
        let [bw_slot, fw_slot] = grid.halo_slots_mut(dim)?;
        let mut sends = Vec::with_capacity(2);
        if let Some(peer) = plan.far_edge_to {
            sends.push(Outgoing {
                peer,
                tag: tag::halo(dim, false),
                data: bw_slot.self_host.prefix(far_bytes)?,
            });
        }
        if let Some(peer) = plan.near_edge_to {
            sends.push(Outgoing {
                peer,
                tag: tag::halo(dim, true),
                data: fw_slot.self_host.prefix(near_bytes)?,
            });
        }
        let mut recvs = Vec::with_capacity(2);
        if let Some(peer) = plan.bw_halo_from {
            recvs.push(Incoming {
                peer,
                tag: tag::halo(dim, false),
                buf: bw_slot.peer_stage.prefix_mut(bw_bytes)?,
            });
        }
        if let Some(peer) = plan.fw_halo_from {
            recvs.push(Incoming {
                peer,
                tag: tag::halo(dim, true),
                buf: fw_slot.peer_stage.prefix_mut(fw_bytes)?,
            });
        }
        comm.exchange(&sends, &mut recvs)?
    };

    // Backend timings cover both directions; split them evenly.
    let num_sends = plan.far_edge_to.iter().chain(&plan.near_edge_to).count() as u32;
    let num_recvs = plan.bw_halo_from.iter().chain(&plan.fw_halo_from).count() as u32;
    if plan.far_edge_to.is_some() {
        prof.upward_mut(dim).cpu_out += times.send / num_sends;
    }
    if plan.near_edge_to.is_some() {
        prof.downward_mut(dim).cpu_out += times.send / num_sends;
    }

    let mut sw = Stopwatch::new();
    if plan.bw_halo_from.is_some() {
        prof.downward_mut(dim).cpu_in += times.recv / num_recvs;
        sw.start();
        grid.commit_peer_halo(dim, false, bw_bytes)?;
        prof.downward_mut(dim).cpu_to_gpu += sw.stop();
    }
    if plan.fw_halo_from.is_some() {
        prof.upward_mut(dim).cpu_in += times.recv / num_recvs;
        sw.start();
        grid.commit_peer_halo(dim, true, fw_bytes)?;
        prof.upward_mut(dim).cpu_to_gpu += sw.stop();
    }
    grid.refresh_descriptor();
    tracing::debug!(
        grid = grid.id(),
        dim,
        bw_halo = grid.halo_bw_width()[dim],
        fw_halo = grid.halo_fw_width()[dim],
        "halo exchanged"
    );
    Ok(())
}
