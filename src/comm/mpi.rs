//! MPI communication backend for multi-process runs.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().ok_or(...)?;
//! let comm = MpiComm::new();
//! ```

use std::time::Instant;

use super::{CommunicationBackend, Incoming, Outgoing, TransferTimes};
use crate::element::{ReduceOp, Scalar};
use crate::error::{HaloError, Result};
use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

/// MPI-based communication backend.
///
/// Wraps the MPI world communicator. Requires `mpi::initialize()` to have
/// been called before construction.
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

fn system_op(op: ReduceOp) -> SystemOperation {
    match op {
        ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Min => SystemOperation::min(),
        ReduceOp::Sum => SystemOperation::sum(),
        ReduceOp::Prod => SystemOperation::product(),
    }
}

macro_rules! all_reduce_as {
    ($world:expr, $v:expr, $op:expr, $ty:ty) => {{
        let mut global: $ty = Default::default();
        $world.all_reduce_into(&$v, &mut global, system_op($op));
        global
    }};
}

impl CommunicationBackend for MpiComm {
    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }

    fn exchange(&self, sends: &[Outgoing<'_>], recvs: &mut [Incoming<'_>]) -> Result<TransferTimes> {
        let world = SimpleCommunicator::world();
        mpi::request::scope(|scope| {
            let start = Instant::now();
            let pending: Vec<_> = sends
                .iter()
                .map(|s| {
                    world
                        .process_at_rank(s.peer as i32)
                        .immediate_send_with_tag(scope, s.data, s.tag)
                })
                .collect();
            let send = start.elapsed();
            let start = Instant::now();
            let mut outcome = Ok(());
            for r in recvs.iter_mut() {
                let expected = r.buf.len();
                let status = world
                    .process_at_rank(r.peer as i32)
                    .receive_into_with_tag(&mut r.buf[..], r.tag);
                let found = status.count(u8::equivalent_datatype()) as usize;
                if found != expected && outcome.is_ok() {
                    outcome = Err(HaloError::SizeMismatch { expected, found });
                }
            }
            for req in pending {
                req.wait();
            }
            outcome.map(|_| TransferTimes {
                send,
                recv: start.elapsed(),
            })
        })
    }

    fn all_reduce(&self, local: Scalar, op: ReduceOp) -> Result<Scalar> {
        let world = SimpleCommunicator::world();
        Ok(match local {
            Scalar::F32(v) => Scalar::F32(all_reduce_as!(world, v, op, f32)),
            Scalar::F64(v) => Scalar::F64(all_reduce_as!(world, v, op, f64)),
            Scalar::I32(v) => Scalar::I32(all_reduce_as!(world, v, op, i32)),
            Scalar::I64(v) => Scalar::I64(all_reduce_as!(world, v, op, i64)),
        })
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        let world = SimpleCommunicator::world();
        let root_process = world.process_at_rank(root as i32);
        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);
        if world.rank() as usize != root {
            data.resize(len as usize, 0);
        }
        if len > 0 {
            root_process.broadcast_into(&mut data[..]);
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        SimpleCommunicator::world().barrier();
        Ok(())
    }
}
