use crate::comm::{tag, Incoming, Outgoing};
use crate::error::Result;
use crate::grid::GridId;
use crate::space::GridSpace;

use super::{Request, StencilTable};

/// A non-root rank serving the master's requests.
pub struct Client {
    space: GridSpace,
    stencils: StencilTable,
}

impl Client {
    pub fn new(space: GridSpace, stencils: StencilTable) -> Self {
        Self { space, stencils }
    }

    pub fn space(&self) -> &GridSpace {
        &self.space
    }

    /// Serve requests until the master finalizes. Returns the grid space.
    pub fn listen(mut self) -> Result<GridSpace> {
        let _span = tracing::debug_span!("client", rank = self.space.rank()).entered();
        loop {
            let mut bytes = Vec::new();
            self.space.comm().broadcast(0, &mut bytes)?;
            let req = Request::decode(&bytes)?;
            tracing::trace!(?req, "request received");
            if !self.handle(req)? {
                break;
            }
        }
        tracing::debug!("client finished");
        Ok(self.space)
    }

    /// Perform this rank's share of `req`. `false` on `Finalize`.
    fn handle(&mut self, req: Request) -> Result<bool> {
        match req {
            Request::GridNew(shape) => {
                self.space.create_grid(&shape)?;
            }
            Request::GridFree(id) => self.space.free_grid(id)?,
            Request::GridCopyin(id) => self.copyin(id)?,
            Request::GridCopyout(id) => self.copyout(id)?,
            Request::ExchangeBoundaries {
                id,
                fw,
                bw,
                diagonal,
                periodic,
            } => self.space.exchange_boundaries(id, &fw, &bw, diagonal, periodic)?,
            Request::Run(inv) => self.stencils.run(&mut self.space, &inv)?,
            Request::Reduce { id, op } => {
                self.space.reduce_grid(op, id)?;
            }
            Request::Finalize => return Ok(false),
        }
        Ok(true)
    }

    fn copyin(&mut self, id: GridId) -> Result<()> {
        let grid = self.space.grid(id)?;
        if grid.is_empty() {
            return Ok(());
        }
        let mut part = vec![0u8; grid.local_bytes()];
        let mut recvs = [Incoming {
            peer: 0,
            tag: tag::RPC_DATA,
            buf: &mut part,
        }];
        self.space.comm().exchange(&[], &mut recvs)?;
        self.space.grid_mut(id)?.copyin_local(&part)
    }

    fn copyout(&mut self, id: GridId) -> Result<()> {
        let grid = self.space.grid(id)?;
        if grid.is_empty() {
            return Ok(());
        }
        let mut part = vec![0u8; grid.local_bytes()];
        grid.copyout_local(&mut part)?;
        let sends = [Outgoing {
            peer: 0,
            tag: tag::RPC_DATA,
            data: &part,
        }];
        self.space.comm().exchange(&sends, &mut [])?;
        Ok(())
    }
}
