//! Per-grid timing of the halo staging pipeline.
//!
//! Every grid gets one [`DataCopyProfile`] per (dimension, direction). The
//! totals only ever grow; they exist to check how well the staging overlaps
//! with compute and never influence the exchange itself.

use std::fmt;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Accumulated time spent in each stage of a halo transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataCopyProfile {
    /// Device memory to pinned/plain host memory.
    pub gpu_to_cpu: Duration,
    /// Posting the network send.
    pub cpu_out: Duration,
    /// Waiting for the network receive.
    pub cpu_in: Duration,
    /// Host memory back to device memory.
    pub cpu_to_gpu: Duration,
}

impl DataCopyProfile {
    pub fn total(&self) -> Duration {
        self.gpu_to_cpu + self.cpu_out + self.cpu_in + self.cpu_to_gpu
    }
}

impl AddAssign for DataCopyProfile {
    fn add_assign(&mut self, rhs: Self) {
        self.gpu_to_cpu += rhs.gpu_to_cpu;
        self.cpu_out += rhs.cpu_out;
        self.cpu_in += rhs.cpu_in;
        self.cpu_to_gpu += rhs.cpu_to_gpu;
    }
}

impl fmt::Display for DataCopyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gpu_to_cpu: {:.6}s, cpu_out: {:.6}s, cpu_in: {:.6}s, cpu_to_gpu: {:.6}s",
            self.gpu_to_cpu.as_secs_f64(),
            self.cpu_out.as_secs_f64(),
            self.cpu_in.as_secs_f64(),
            self.cpu_to_gpu.as_secs_f64()
        )
    }
}

/// Profiles of one grid, indexed `dim * 2` (traffic with the forward peer)
/// and `dim * 2 + 1` (traffic with the backward peer).
#[derive(Clone, Debug, Default)]
pub struct GridProfile {
    entries: Vec<DataCopyProfile>,
}

impl GridProfile {
    pub fn new(num_dims: usize) -> Self {
        Self {
            entries: vec![DataCopyProfile::default(); num_dims * 2],
        }
    }

    pub fn upward(&self, dim: usize) -> &DataCopyProfile {
        &self.entries[dim * 2]
    }

    pub fn downward(&self, dim: usize) -> &DataCopyProfile {
        &self.entries[dim * 2 + 1]
    }

    pub(crate) fn upward_mut(&mut self, dim: usize) -> &mut DataCopyProfile {
        &mut self.entries[dim * 2]
    }

    pub(crate) fn downward_mut(&mut self, dim: usize) -> &mut DataCopyProfile {
        &mut self.entries[dim * 2 + 1]
    }

    pub fn num_dims(&self) -> usize {
        self.entries.len() / 2
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().map(DataCopyProfile::total).sum()
    }
}

impl fmt::Display for GridProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dim in 0..self.num_dims() {
            if dim > 0 {
                write!(f, "; ")?;
            }
            write!(f, "upw: {{{}}}, dwn: {{{}}}", self.upward(dim), self.downward(dim))?;
        }
        Ok(())
    }
}

/// Simple start/stop timer.
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Time since the last `start`.
    pub fn stop(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_accumulate() {
        let mut p = DataCopyProfile::default();
        p += DataCopyProfile {
            gpu_to_cpu: Duration::from_millis(2),
            cpu_out: Duration::from_millis(1),
            ..Default::default()
        };
        p += DataCopyProfile {
            gpu_to_cpu: Duration::from_millis(3),
            cpu_to_gpu: Duration::from_millis(4),
            ..Default::default()
        };
        assert_eq!(p.gpu_to_cpu, Duration::from_millis(5));
        assert_eq!(p.total(), Duration::from_millis(10));
    }

    #[test]
    fn grid_profile_layout() {
        let mut g = GridProfile::new(3);
        g.downward_mut(2).cpu_in += Duration::from_millis(7);
        assert_eq!(g.num_dims(), 3);
        assert_eq!(g.downward(2).cpu_in, Duration::from_millis(7));
        assert_eq!(g.upward(2).cpu_in, Duration::ZERO);
        assert_eq!(g.total(), Duration::from_millis(7));
        assert!(g.to_string().contains("upw"));
    }
}
