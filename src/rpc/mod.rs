//! Master/client control of a grid space.
//!
//! Rank 0 drives the computation through a [`Master`]. Every call encodes
//! a [`Request`] with bincode, broadcasts it, and then performs its own
//! share of the work. All other ranks sit in [`Client::listen`], decoding
//! requests and performing the matching share until `Finalize`.
//!
//! Bulk grid data (copy-in, copy-out) does not travel inside requests: it
//! is scattered or gathered point to point under [`tag::RPC_DATA`].
//!
//! [`tag::RPC_DATA`]: crate::comm::tag::RPC_DATA

mod client;
mod master;

use serde::{Deserialize, Serialize};

pub use client::Client;
pub use master::Master;

use crate::element::{ReduceOp, Scalar};
use crate::error::{HaloError, Result};
use crate::grid::{GridId, GridShape};
use crate::index::WidthArray;
use crate::space::GridSpace;

/// A request broadcast from the master to every client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    GridNew(GridShape),
    GridFree(GridId),
    /// Followed by one `RPC_DATA` message per rank with a non-empty
    /// partition.
    GridCopyin(GridId),
    /// Answered by one `RPC_DATA` message per rank with a non-empty
    /// partition.
    GridCopyout(GridId),
    ExchangeBoundaries {
        id: GridId,
        fw: WidthArray,
        bw: WidthArray,
        diagonal: bool,
        periodic: bool,
    },
    Run(StencilInvocation),
    Reduce {
        id: GridId,
        op: ReduceOp,
    },
    Finalize,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Arguments of a stencil run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StencilInvocation {
    /// Index into the [`StencilTable`].
    pub index: usize,
    pub iterations: usize,
    /// Grids the kernel reads and writes, in kernel parameter order.
    pub grids: Vec<GridId>,
    /// Scalar kernel parameters.
    pub params: Vec<Scalar>,
}

/// A stencil kernel. Called once per iteration on every rank with the
/// rank's grid space; performs its own halo exchanges.
pub type StencilFn = fn(&mut GridSpace, &StencilInvocation) -> Result<()>;

/// Kernels registered with the runtime, addressed by index. Master and
/// clients must register the same kernels in the same order.
#[derive(Clone, Default)]
pub struct StencilTable {
    kernels: Vec<(String, StencilFn)>,
}

impl StencilTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` and return its index.
    pub fn register(&mut self, name: impl Into<String>, kernel: StencilFn) -> usize {
        self.kernels.push((name.into(), kernel));
        self.kernels.len() - 1
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.kernels.get(index).map(|(name, _)| name.as_str())
    }

    /// Run the invocation's kernel for its number of iterations.
    pub fn run(&self, space: &mut GridSpace, inv: &StencilInvocation) -> Result<()> {
        let (name, kernel) = self
            .kernels
            .get(inv.index)
            .ok_or_else(|| HaloError::Rpc(format!("no stencil with index {}", inv.index)))?;
        let _span = tracing::debug_span!("run", stencil = %name, iterations = inv.iterations).entered();
        for _ in 0..inv.iterations {
            kernel(space, inv)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StencilTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kernels.iter().map(|(name, _)| name)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;
    use crate::index::IndexArray;

    #[test]
    fn requests_survive_encoding() {
        let requests = [
            Request::GridNew(
                GridShape::new(ElementType::Double, 2, IndexArray::new(8, 4, 1))
                    .with_global_offset(IndexArray::new(1, 0, 0)),
            ),
            Request::ExchangeBoundaries {
                id: 3,
                fw: [1, 2, 0],
                bw: [0, 1, 0],
                diagonal: true,
                periodic: false,
            },
            Request::Run(StencilInvocation {
                index: 1,
                iterations: 5,
                grids: vec![0, 1],
                params: vec![Scalar::F32(0.25)],
            }),
            Request::Reduce { id: 0, op: ReduceOp::Prod },
            Request::Finalize,
        ];
        for req in requests {
            assert_eq!(Request::decode(&req.encode().unwrap()).unwrap(), req);
        }
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(Request::decode(&[0xff; 3]), Err(HaloError::Codec(_))));
    }

    #[test]
    fn unknown_stencil_index() {
        let table = StencilTable::new();
        assert!(table.is_empty());
        let procs = crate::space::ProcessGrid::new(&[1]).unwrap();
        let mut gs = GridSpace::new(
            1,
            IndexArray::new(4, 1, 1),
            procs,
            std::sync::Arc::new(crate::comm::SingleProcessComm),
            crate::device::DeviceContext::emulated(),
        )
        .unwrap();
        let inv = StencilInvocation {
            index: 2,
            iterations: 1,
            ..Default::default()
        };
        assert!(matches!(table.run(&mut gs, &inv), Err(HaloError::Rpc(_))));
    }
}
