//! Runtime configuration: the grid space geometry, the process grid and
//! the device.

use std::sync::Arc;

use crate::comm::CommunicationBackend;
use crate::device::{DeviceContext, DeviceKind};
use crate::error::{HaloError, Result};
use crate::index::{IndexArray, MAX_DIMS};
use crate::space::partition::extents;
use crate::space::{GridSpace, ProcessGrid};

/// Environment variable overriding the process grid shape, e.g. `2x2x1`.
pub const PROC_GRID_ENV: &str = "HALOCLINE_PROC_GRID";

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub num_dims: usize,
    pub global_size: IndexArray,
    /// Explicit process grid; chosen from the rank count if `None`.
    pub proc_grid: Option<ProcessGrid>,
    pub device: DeviceKind,
}

impl RuntimeConfig {
    pub fn new(num_dims: usize, global_size: IndexArray) -> Self {
        Self {
            num_dims,
            global_size,
            proc_grid: None,
            device: DeviceKind::Emulated,
        }
    }

    /// Configuration for a space given as `"64x64x32"`.
    pub fn from_size_str(size: &str) -> Result<Self> {
        let (_, dims) = extents(size).map_err(|e| HaloError::Config(format!("invalid grid size '{size}': {e}")))?;
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(HaloError::UnsupportedDimensions(dims.len()));
        }
        let sizes: Vec<i64> = dims.iter().map(|&v| v as i64).collect();
        Ok(Self::new(dims.len(), IndexArray::from_slice(&sizes, 1)))
    }

    pub fn with_proc_grid(mut self, procs: ProcessGrid) -> Self {
        self.proc_grid = Some(procs);
        self
    }

    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    /// Apply [`PROC_GRID_ENV`] if it is set and no process grid was given.
    pub fn with_env(self) -> Result<Self> {
        match std::env::var(PROC_GRID_ENV) {
            Ok(value) if self.proc_grid.is_none() => {
                let procs = value.parse()?;
                tracing::debug!(%procs, "process grid from {PROC_GRID_ENV}");
                Ok(self.with_proc_grid(procs))
            }
            _ => Ok(self),
        }
    }

    /// The process grid for `num_ranks` ranks.
    pub fn process_grid(&self, num_ranks: usize) -> Result<ProcessGrid> {
        match self.proc_grid {
            Some(procs) if procs.num_procs() != num_ranks => Err(HaloError::ProcessGrid(format!(
                "process grid {procs} needs {} ranks, {num_ranks} available",
                procs.num_procs()
            ))),
            Some(procs) => Ok(procs),
            None => ProcessGrid::auto(num_ranks, self.num_dims, &self.global_size),
        }
    }

    /// Build this rank's grid space on a fresh device context.
    pub fn build_space(&self, comm: Arc<dyn CommunicationBackend>) -> Result<GridSpace> {
        let ctx = DeviceContext::from_kind(self.device)?;
        self.build_space_on(comm, ctx)
    }

    /// Build this rank's grid space on an existing device context.
    pub fn build_space_on(&self, comm: Arc<dyn CommunicationBackend>, ctx: Arc<DeviceContext>) -> Result<GridSpace> {
        let procs = self.process_grid(comm.num_ranks())?;
        GridSpace::new(self.num_dims, self.global_size, procs, comm, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcessComm;

    #[test]
    fn size_string() {
        let cfg = RuntimeConfig::from_size_str("16x8").unwrap();
        assert_eq!(cfg.num_dims, 2);
        assert_eq!(cfg.global_size, IndexArray::new(16, 8, 1));
        assert!(RuntimeConfig::from_size_str("16x").is_err());
        assert!(matches!(
            RuntimeConfig::from_size_str("2x2x2x2"),
            Err(HaloError::UnsupportedDimensions(4))
        ));
    }

    #[test]
    fn explicit_grid_must_match_rank_count() {
        let cfg = RuntimeConfig::new(2, IndexArray::new(8, 8, 1)).with_proc_grid("2x2".parse().unwrap());
        assert!(cfg.process_grid(4).is_ok());
        assert!(matches!(cfg.process_grid(3), Err(HaloError::ProcessGrid(_))));
    }

    #[test]
    fn auto_grid_for_single_rank() {
        let cfg = RuntimeConfig::new(3, IndexArray::new(4, 4, 4));
        let gs = cfg.build_space(Arc::new(SingleProcessComm)).unwrap();
        assert_eq!(gs.proc_grid().num_procs(), 1);
        assert_eq!(gs.num_dims(), 3);
    }
}
