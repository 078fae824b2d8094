//! In-process communication backend: every rank is a thread, messages travel
//! over unbounded crossbeam channels.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use std::time::Instant;

use super::{tag, CommunicationBackend, Incoming, Outgoing, TransferTimes};
use crate::element::{ElementType, ReduceOp, Scalar};
use crate::error::{HaloError, Result};

struct Envelope {
    src: usize,
    tag: i32,
    payload: Vec<u8>,
}

/// Result of a reduction as rank 0 sends it back: the value, or the pair of
/// element types that could not be combined.
type ReduceOutcome = std::result::Result<Scalar, (ElementType, ElementType)>;

fn mismatch((expected, found): (ElementType, ElementType)) -> HaloError {
    HaloError::TypeMismatch {
        expected: expected.name(),
        found: found.name(),
    }
}

/// One rank's endpoint of an in-process universe.
///
/// Sends never block, so posting all sends before the receives cannot
/// deadlock. Messages from one source with one tag arrive in send order.
pub struct LocalComm {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    // Messages that arrived before anyone asked for them.
    stash: Mutex<Vec<Envelope>>,
}

impl LocalComm {
    /// Create the endpoints of a universe of `num_ranks` ranks. Endpoint `i`
    /// is rank `i`; hand each to its own thread.
    pub fn universe(num_ranks: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_ranks).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                outboxes: senders.clone(),
                inbox,
                stash: Mutex::new(Vec::new()),
            })
            .collect()
    }

    fn send(&self, dst: usize, tag: i32, payload: Vec<u8>) -> Result<()> {
        let outbox = self
            .outboxes
            .get(dst)
            .ok_or_else(|| HaloError::Comm(format!("rank {dst} does not exist")))?;
        outbox
            .send(Envelope {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| HaloError::Comm(format!("rank {dst} has shut down")))
    }

    fn recv(&self, src: usize, tag: i32) -> Result<Vec<u8>> {
        {
            let mut stash = self.stash.lock();
            if let Some(pos) = stash.iter().position(|e| e.src == src && e.tag == tag) {
                return Ok(stash.remove(pos).payload);
            }
        }
        loop {
            let env = self
                .inbox
                .recv()
                .map_err(|_| HaloError::Comm(format!("rank {} inbox closed", self.rank)))?;
            if env.src == src && env.tag == tag {
                return Ok(env.payload);
            }
            self.stash.lock().push(env);
        }
    }
}

impl CommunicationBackend for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.outboxes.len()
    }

    fn exchange(&self, sends: &[Outgoing<'_>], recvs: &mut [Incoming<'_>]) -> Result<TransferTimes> {
        let start = Instant::now();
        for s in sends {
            self.send(s.peer, s.tag, s.data.to_vec())?;
        }
        let send = start.elapsed();
        let start = Instant::now();
        for r in recvs.iter_mut() {
            let payload = self.recv(r.peer, r.tag)?;
            if payload.len() != r.buf.len() {
                return Err(HaloError::SizeMismatch {
                    expected: r.buf.len(),
                    found: payload.len(),
                });
            }
            r.buf.copy_from_slice(&payload);
        }
        // Payloads were copied at send time, so the send buffers are free.
        Ok(TransferTimes {
            send,
            recv: start.elapsed(),
        })
    }

    // Rank 0 combines and sends back the outcome, a type mismatch included,
    // so every rank returns the same result.
    fn all_reduce(&self, local: Scalar, op: ReduceOp) -> Result<Scalar> {
        if self.rank == 0 {
            let mut values = Vec::with_capacity(self.num_ranks() - 1);
            for src in 1..self.num_ranks() {
                values.push(bincode::deserialize::<Scalar>(&self.recv(src, tag::REDUCE)?)?);
            }
            let outcome: ReduceOutcome = values.into_iter().try_fold(local, |acc, v| {
                op.apply(acc, v).map_err(|_| (acc.element_type(), v.element_type()))
            });
            let encoded = bincode::serialize(&outcome)?;
            for dst in 1..self.num_ranks() {
                self.send(dst, tag::REDUCE, encoded.clone())?;
            }
            outcome.map_err(mismatch)
        } else {
            self.send(0, tag::REDUCE, bincode::serialize(&local)?)?;
            let outcome: ReduceOutcome = bincode::deserialize(&self.recv(0, tag::REDUCE)?)?;
            outcome.map_err(mismatch)
        }
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        if self.rank == root {
            for dst in (0..self.num_ranks()).filter(|&r| r != root) {
                self.send(dst, tag::BROADCAST, data.clone())?;
            }
        } else {
            *data = self.recv(root, tag::BROADCAST)?;
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.all_reduce(Scalar::I32(0), ReduceOp::Sum).map(|_| ())
    }
}
