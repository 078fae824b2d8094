use crate::buffer::PinnedBuffer;
use crate::comm::{tag, Incoming, Outgoing};
use crate::element::{Element, ReduceOp};
use crate::error::{HaloError, Result};
use crate::grid::{GridId, GridShape};
use crate::index::{copyin_subgrid, copyout_subgrid, IndexArray, WidthArray};
use crate::space::{GridSpace, ReduceResult};

use super::{Request, StencilInvocation, StencilTable};

/// Rank 0's handle on the distributed runtime.
pub struct Master {
    space: GridSpace,
    stencils: StencilTable,
    /// Staging of the master's own partition during copy-in and copy-out.
    stage: PinnedBuffer,
}

impl Master {
    pub fn new(space: GridSpace, stencils: StencilTable) -> Result<Self> {
        if space.rank() != 0 {
            return Err(HaloError::Rpc(format!("master must run on rank 0, not {}", space.rank())));
        }
        Ok(Self {
            space,
            stencils,
            stage: PinnedBuffer::default(),
        })
    }

    pub fn space(&self) -> &GridSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut GridSpace {
        &mut self.space
    }

    fn send(&self, req: &Request) -> Result<()> {
        tracing::trace!(?req, "broadcasting request");
        let mut bytes = req.encode()?;
        self.space.comm().broadcast(0, &mut bytes)
    }

    pub fn grid_new(&mut self, shape: &GridShape) -> Result<GridId> {
        self.send(&Request::GridNew(shape.clone()))?;
        self.space.create_grid(shape)
    }

    pub fn grid_free(&mut self, id: GridId) -> Result<()> {
        self.space.grid(id)?;
        self.send(&Request::GridFree(id))?;
        self.space.free_grid(id)
    }

    /// Scatter `data`, a packed array covering the whole grid, over the
    /// ranks' partitions.
    pub fn grid_copyin(&mut self, id: GridId, data: &[u8]) -> Result<()> {
        let grid = self.space.grid(id)?;
        let nd = grid.num_dims();
        let elm = grid.elm_size();
        let gsize = grid.size();
        let goff = grid.global_offset();
        let expected = grid.shape().num_elements() as usize * elm;
        if data.len() != expected {
            return Err(HaloError::SizeMismatch {
                expected,
                found: data.len(),
            });
        }
        self.send(&Request::GridCopyin(id))?;

        let mut parts = Vec::new();
        for rank in 0..self.space.num_ranks() {
            let (offset, size) = self.space.partition_of(id, rank)?;
            if size.is_degenerate(nd) {
                continue;
            }
            let mut part = vec![0u8; size.accumulate(nd) as usize * elm];
            copyout_subgrid(elm, nd, data, &gsize, &mut part, &(offset - goff), &size);
            parts.push((rank, part));
        }
        let sends: Vec<Outgoing<'_>> = parts
            .iter()
            .filter(|(rank, _)| *rank != 0)
            .map(|(rank, part)| Outgoing {
                peer: *rank,
                tag: tag::RPC_DATA,
                data: part,
            })
            .collect();
        self.space.comm().exchange(&sends, &mut [])?;

        if let Some((_, own)) = parts.iter().find(|(rank, _)| *rank == 0) {
            self.stage.ensure_capacity(own.len())?;
            let staged = self.stage.prefix_mut(own.len())?;
            staged.copy_from_slice(own);
            let staged = self.stage.prefix(own.len())?;
            self.space.grid_mut(id)?.copyin_local(staged)?;
        }
        tracing::debug!(grid = id, parts = parts.len(), "grid scattered");
        Ok(())
    }

    /// Typed convenience wrapper around [`Master::grid_copyin`].
    pub fn grid_copyin_typed<T: Element>(&mut self, id: GridId, data: &[T]) -> Result<()> {
        let elm_type = self.space.grid(id)?.elm_type();
        if T::TYPE != elm_type {
            return Err(HaloError::TypeMismatch {
                expected: elm_type.name(),
                found: T::TYPE.name(),
            });
        }
        self.grid_copyin(id, bytemuck::cast_slice(data))
    }

    /// Gather the ranks' partitions into `out`, a packed array covering the
    /// whole grid.
    pub fn grid_copyout(&mut self, id: GridId, out: &mut [u8]) -> Result<()> {
        let grid = self.space.grid(id)?;
        let nd = grid.num_dims();
        let elm = grid.elm_size();
        let gsize = grid.size();
        let goff = grid.global_offset();
        let expected = grid.shape().num_elements() as usize * elm;
        if out.len() != expected {
            return Err(HaloError::SizeMismatch {
                expected,
                found: out.len(),
            });
        }
        self.send(&Request::GridCopyout(id))?;

        let mut parts: Vec<(usize, IndexArray, IndexArray, Vec<u8>)> = Vec::new();
        for rank in 0..self.space.num_ranks() {
            let (offset, size) = self.space.partition_of(id, rank)?;
            if !size.is_degenerate(nd) {
                parts.push((rank, offset, size, vec![0u8; size.accumulate(nd) as usize * elm]));
            }
        }
        {
            let mut recvs: Vec<Incoming<'_>> = parts
                .iter_mut()
                .filter(|(rank, ..)| *rank != 0)
                .map(|(rank, _, _, buf)| Incoming {
                    peer: *rank,
                    tag: tag::RPC_DATA,
                    buf: buf.as_mut_slice(),
                })
                .collect();
            self.space.comm().exchange(&[], &mut recvs)?;
        }
        if let Some((_, _, _, own)) = parts.iter_mut().find(|(rank, ..)| *rank == 0) {
            let n = own.len();
            self.stage.ensure_capacity(n)?;
            self.space.grid(id)?.copyout_local(self.stage.prefix_mut(n)?)?;
            own.copy_from_slice(self.stage.prefix(n)?);
        }
        for (_, offset, size, part) in &parts {
            copyin_subgrid(elm, nd, out, &gsize, part, &(*offset - goff), size);
        }
        tracing::debug!(grid = id, parts = parts.len(), "grid gathered");
        Ok(())
    }

    /// Typed convenience wrapper around [`Master::grid_copyout`].
    pub fn grid_copyout_typed<T: Element>(&mut self, id: GridId) -> Result<Vec<T>> {
        let grid = self.space.grid(id)?;
        if T::TYPE != grid.elm_type() {
            return Err(HaloError::TypeMismatch {
                expected: grid.elm_type().name(),
                found: T::TYPE.name(),
            });
        }
        let mut out = vec![T::zeroed(); grid.shape().num_elements() as usize];
        self.grid_copyout(id, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub fn exchange_boundaries(
        &mut self,
        id: GridId,
        fw: &WidthArray,
        bw: &WidthArray,
        diagonal: bool,
        periodic: bool,
    ) -> Result<()> {
        self.space.grid(id)?;
        self.send(&Request::ExchangeBoundaries {
            id,
            fw: *fw,
            bw: *bw,
            diagonal,
            periodic,
        })?;
        self.space.exchange_boundaries(id, fw, bw, diagonal, periodic)
    }

    /// Run a registered stencil on every rank.
    pub fn run(&mut self, inv: &StencilInvocation) -> Result<()> {
        if inv.index >= self.stencils.len() {
            return Err(HaloError::Rpc(format!("no stencil with index {}", inv.index)));
        }
        self.send(&Request::Run(inv.clone()))?;
        self.stencils.run(&mut self.space, inv)
    }

    pub fn reduce(&mut self, id: GridId, op: ReduceOp) -> Result<ReduceResult> {
        self.space.grid(id)?;
        self.send(&Request::Reduce { id, op })?;
        self.space.reduce_grid(op, id)
    }

    /// Release the clients and return the grid space.
    pub fn finalize(self) -> Result<GridSpace> {
        self.send(&Request::Finalize)?;
        tracing::debug!("runtime finalized");
        Ok(self.space)
    }
}
