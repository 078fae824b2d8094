//! The grid space: global decomposition plus the registry of this rank's
//! grids.
//!
//! Every rank constructs an identical `GridSpace` and performs the same
//! sequence of collective calls (grid creation, exchanges, fetches,
//! reductions). Partitions are derived from the [`Decomposition`] without
//! communication.

mod exchange;
mod fetch;
pub mod partition;
mod reduce;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::buffer::HostBuffer;
use crate::comm::CommunicationBackend;
use crate::device::DeviceContext;
use crate::error::{HaloError, Result};
use crate::grid::{Grid, GridId, GridShape};
use crate::index::{IndexArray, MAX_DIMS};
use crate::profile::GridProfile;

pub use fetch::FetchInfo;
pub use partition::{Decomposition, ProcessGrid};
pub use reduce::ReduceResult;

pub struct GridSpace {
    decomposition: Decomposition,
    rank: usize,
    coords: [usize; MAX_DIMS],
    comm: Arc<dyn CommunicationBackend>,
    ctx: Arc<DeviceContext>,
    grids: BTreeMap<GridId, Grid>,
    profiles: BTreeMap<GridId, GridProfile>,
    /// Parameters of each grid's last neighbor load, for `reuse`.
    last_loads: BTreeMap<GridId, fetch::NeighborLoad>,
    next_id: GridId,
    /// Staging area for sub-rectangles served to fetch requests.
    fetch_buf: HostBuffer,
}

impl GridSpace {
    /// Create the space of `num_dims` dimensions and extent `global_size`,
    /// decomposed over `procs`. The process grid must have exactly as many
    /// processes as `comm` has ranks.
    pub fn new(
        num_dims: usize,
        global_size: IndexArray,
        procs: ProcessGrid,
        comm: Arc<dyn CommunicationBackend>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        if procs.num_procs() != comm.num_ranks() {
            return Err(HaloError::ProcessGrid(format!(
                "process grid {procs} has {} processes but {} ranks are running",
                procs.num_procs(),
                comm.num_ranks()
            )));
        }
        let decomposition = Decomposition::new(num_dims, global_size, procs)?;
        let rank = comm.rank();
        let coords = decomposition.procs().coords(rank);
        let (offset, size) = decomposition.space_partition(&coords);
        tracing::debug!(rank, ?coords, %offset, %size, "grid space created");
        Ok(Self {
            decomposition,
            rank,
            coords,
            comm,
            ctx,
            grids: BTreeMap::new(),
            profiles: BTreeMap::new(),
            last_loads: BTreeMap::new(),
            next_id: 0,
            fetch_buf: HostBuffer::default(),
        })
    }

    pub fn num_dims(&self) -> usize {
        self.decomposition.num_dims()
    }

    pub fn global_size(&self) -> IndexArray {
        self.decomposition.global_size()
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    pub fn proc_grid(&self) -> &ProcessGrid {
        self.decomposition.procs()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.comm.num_ranks()
    }

    /// Process-grid coordinates of this rank.
    pub fn coords(&self) -> [usize; MAX_DIMS] {
        self.coords
    }

    pub fn comm(&self) -> &Arc<dyn CommunicationBackend> {
        &self.comm
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Create a grid and allocate this rank's partition of it. Grids with
    /// fewer dimensions than the space are padded with size-1 dimensions.
    pub fn create_grid(&mut self, shape: &GridShape) -> Result<GridId> {
        let nd = self.num_dims();
        if shape.num_dims > nd {
            return Err(HaloError::DimensionMismatch {
                requested: shape.num_dims,
                available: nd,
            });
        }
        let mut shape = shape.clone();
        shape.size = IndexArray::from_slice(&shape.size.0[..shape.num_dims], 1);
        shape.global_offset = IndexArray::from_slice(&shape.global_offset.0[..shape.num_dims], 0);
        shape.num_dims = nd;

        let id = self.next_id;
        let (offset, size) = self
            .decomposition
            .grid_partition(&self.coords, &shape.global_offset, &shape.size);
        let grid = Grid::create(id, &shape, offset, size, self.ctx.clone())?;
        tracing::debug!(
            grid = id,
            elm = shape.elm_type.name(),
            size = %shape.size,
            local_offset = %offset,
            local_size = %size,
            empty = grid.is_empty(),
            "grid created"
        );
        self.grids.insert(id, grid);
        self.profiles.insert(id, GridProfile::new(nd));
        self.next_id += 1;
        Ok(id)
    }

    pub fn free_grid(&mut self, id: GridId) -> Result<()> {
        self.grids.remove(&id).ok_or(HaloError::UnknownGrid(id))?;
        self.profiles.remove(&id);
        self.last_loads.remove(&id);
        tracing::debug!(grid = id, "grid freed");
        Ok(())
    }

    pub fn grid(&self, id: GridId) -> Result<&Grid> {
        self.grids.get(&id).ok_or(HaloError::UnknownGrid(id))
    }

    pub fn grid_mut(&mut self, id: GridId) -> Result<&mut Grid> {
        self.grids.get_mut(&id).ok_or(HaloError::UnknownGrid(id))
    }

    pub fn grid_ids(&self) -> impl Iterator<Item = GridId> + '_ {
        self.grids.keys().copied()
    }

    /// Partition of grid `id` owned by `rank`.
    pub fn partition_of(&self, id: GridId, rank: usize) -> Result<(IndexArray, IndexArray)> {
        let grid = self.grid(id)?;
        let coords = self.decomposition.procs().coords(rank);
        Ok(self
            .decomposition
            .grid_partition(&coords, &grid.global_offset(), &grid.size()))
    }

    pub fn profile(&self, id: GridId) -> Option<&GridProfile> {
        self.profiles.get(&id)
    }

    /// Per-grid copy profiles, one block per grid.
    pub fn profile_report(&self) -> String {
        let mut out = String::new();
        for (id, prof) in &self.profiles {
            let _ = writeln!(out, "rank {} grid {id}: {prof}", self.rank);
        }
        out
    }

    /// The grid and its profile, borrowed together.
    fn grid_and_profile(&mut self, id: GridId) -> Result<(&mut Grid, &mut GridProfile)> {
        let grid = self.grids.get_mut(&id).ok_or(HaloError::UnknownGrid(id))?;
        let nd = grid.num_dims();
        let prof = self.profiles.entry(id).or_insert_with(|| GridProfile::new(nd));
        Ok((grid, prof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcessComm;
    use crate::element::ElementType;

    fn space(nd: usize, size: IndexArray) -> GridSpace {
        let procs = ProcessGrid::new(&vec![1; nd]).unwrap();
        GridSpace::new(
            nd,
            size,
            procs,
            Arc::new(SingleProcessComm),
            DeviceContext::emulated(),
        )
        .unwrap()
    }

    #[test]
    fn grids_get_sequential_ids() {
        let mut gs = space(2, IndexArray::new(4, 4, 1));
        let shape = GridShape::new(ElementType::Float, 2, IndexArray::new(4, 4, 1));
        assert_eq!(gs.create_grid(&shape).unwrap(), 0);
        assert_eq!(gs.create_grid(&shape).unwrap(), 1);
        gs.free_grid(0).unwrap();
        assert!(matches!(gs.grid(0), Err(HaloError::UnknownGrid(0))));
        assert_eq!(gs.grid_ids().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn lower_dimensional_grid_is_padded() {
        let mut gs = space(3, IndexArray::new(4, 4, 4));
        let shape = GridShape::new(ElementType::Double, 1, IndexArray::new(3, 9, 9));
        let id = gs.create_grid(&shape).unwrap();
        let g = gs.grid(id).unwrap();
        assert_eq!(g.num_dims(), 3);
        assert_eq!(g.size(), IndexArray::new(3, 1, 1));
        assert_eq!(g.local_size(), IndexArray::new(3, 1, 1));
    }

    #[test]
    fn too_many_dimensions_is_rejected() {
        let mut gs = space(2, IndexArray::new(4, 4, 1));
        let shape = GridShape::new(ElementType::Int, 3, IndexArray::new(4, 4, 4));
        assert!(matches!(
            gs.create_grid(&shape),
            Err(HaloError::DimensionMismatch {
                requested: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn process_count_must_match_ranks() {
        let procs = ProcessGrid::new(&[2, 1]).unwrap();
        let err = GridSpace::new(
            2,
            IndexArray::new(4, 4, 1),
            procs,
            Arc::new(SingleProcessComm),
            DeviceContext::emulated(),
        );
        assert!(matches!(err, Err(HaloError::ProcessGrid(_))));
    }

    #[test]
    fn profile_report_lists_every_grid() {
        let mut gs = space(1, IndexArray::new(8, 1, 1));
        let shape = GridShape::new(ElementType::Float, 1, IndexArray::new(8, 1, 1));
        gs.create_grid(&shape).unwrap();
        gs.create_grid(&shape).unwrap();
        let report = gs.profile_report();
        assert!(report.contains("grid 0"));
        assert!(report.contains("grid 1"));
    }
}
