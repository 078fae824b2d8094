//! Communication backend abstraction for the halo exchange.
//!
//! Provides a trait for point-to-point halo traffic and collectives, a
//! single-process implementation, an in-process multi-rank implementation
//! for running several ranks as threads, and (feature `distributed`) an MPI
//! implementation.

mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

pub use local::LocalComm;

use std::time::{Duration, Instant};

use crate::element::{ReduceOp, Scalar};
use crate::error::{HaloError, Result};

/// Message tags. Halo messages carry `HALO_BASE + 2 * dim + direction`.
pub mod tag {
    pub const HALO_BASE: i32 = 100;
    pub const FETCH_REQUEST: i32 = 200;
    pub const FETCH_REPLY: i32 = 201;
    pub const RPC_DATA: i32 = 300;
    pub const BROADCAST: i32 = 400;
    pub const REDUCE: i32 = 401;

    /// Tag of the halo that fills the receiver's forward (`true`) or
    /// backward halo of `dim`.
    pub fn halo(dim: usize, forward: bool) -> i32 {
        HALO_BASE + 2 * dim as i32 + forward as i32
    }
}

/// A send posted as part of an [`CommunicationBackend::exchange`].
pub struct Outgoing<'a> {
    pub peer: usize,
    pub tag: i32,
    pub data: &'a [u8],
}

/// A receive completed as part of an [`CommunicationBackend::exchange`].
/// The message must be exactly `buf.len()` bytes long.
pub struct Incoming<'a> {
    pub peer: usize,
    pub tag: i32,
    pub buf: &'a mut [u8],
}

/// Wall time spent in the two halves of an [`CommunicationBackend::exchange`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferTimes {
    /// Posting the sends.
    pub send: Duration,
    /// Completing the receives and waiting on the sends.
    pub recv: Duration,
}

/// Abstraction over inter-process communication.
///
/// Implementations: `SingleProcessComm`, `LocalComm` (ranks as threads),
/// `MpiComm` (via the mpi crate).
pub trait CommunicationBackend: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;

    /// Point-to-point exchange.
    ///
    /// Every send is posted without blocking, then the receives complete in
    /// the given order, then the call waits until all send buffers may be
    /// reused. A send to this rank itself is legal and matches a receive
    /// from this rank with the same tag.
    fn exchange(&self, sends: &[Outgoing<'_>], recvs: &mut [Incoming<'_>]) -> Result<TransferTimes>;

    /// Combine one scalar from every rank; every rank gets the result.
    fn all_reduce(&self, local: Scalar, op: ReduceOp) -> Result<Scalar>;

    /// Replace `data` on every rank with the root's contents.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()>;

    /// Synchronization barrier.
    fn barrier(&self) -> Result<()>;
}

/// Communication backend for a single rank.
///
/// Collectives pass values through unchanged. Self-addressed messages (a
/// periodic exchange over a one-process dimension) are delivered directly.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn exchange(&self, sends: &[Outgoing<'_>], recvs: &mut [Incoming<'_>]) -> Result<TransferTimes> {
        let start = Instant::now();
        let mut used = vec![false; sends.len()];
        for recv in recvs.iter_mut() {
            let found = sends
                .iter()
                .enumerate()
                .find(|(i, s)| !used[*i] && s.peer == 0 && s.tag == recv.tag && recv.peer == 0);
            let Some((i, send)) = found else {
                return Err(HaloError::Comm(format!(
                    "no matching send for receive from rank {} with tag {}",
                    recv.peer, recv.tag
                )));
            };
            if send.data.len() != recv.buf.len() {
                return Err(HaloError::SizeMismatch {
                    expected: recv.buf.len(),
                    found: send.data.len(),
                });
            }
            recv.buf.copy_from_slice(send.data);
            used[i] = true;
        }
        Ok(TransferTimes {
            send: Duration::ZERO,
            recv: start.elapsed(),
        })
    }

    fn all_reduce(&self, local: Scalar, _op: ReduceOp) -> Result<Scalar> {
        Ok(local)
    }

    fn broadcast(&self, _root: usize, _data: &mut Vec<u8>) -> Result<()> {
        // Single process: data is already everywhere.
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
