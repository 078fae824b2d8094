use serde::{Deserialize, Serialize};

use super::GridSpace;
use crate::element::{ReduceOp, Scalar};
use crate::error::Result;
use crate::grid::GridId;

/// Outcome of a global reduction, available on every rank.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReduceResult {
    pub value: Scalar,
    /// Number of elements reduced across all ranks.
    pub num_elements: usize,
}

impl GridSpace {
    /// Reduce every element of grid `id` with `op`. Collective.
    ///
    /// Ranks with an empty partition contribute the identity of `op`.
    pub fn reduce_grid(&self, op: ReduceOp, id: GridId) -> Result<ReduceResult> {
        let grid = self.grid(id)?;
        let local = grid
            .reduce_local(op)?
            .unwrap_or_else(|| op.identity(grid.elm_type()));
        let value = self.comm.all_reduce(local, op)?;
        let num_elements = grid.shape().num_elements() as usize;
        tracing::debug!(grid = id, ?op, %local, %value, "grid reduced");
        Ok(ReduceResult { value, num_elements })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use crate::comm::SingleProcessComm;
    use crate::device::DeviceContext;
    use crate::element::{ElementType, ReduceOp, Scalar};
    use crate::grid::GridShape;
    use crate::index::IndexArray;
    use crate::space::{GridSpace, ProcessGrid};

    #[test]
    fn single_rank_sum_and_max() {
        let size = IndexArray::new(3, 4, 1);
        let procs = ProcessGrid::new(&[1, 1]).unwrap();
        let mut gs = GridSpace::new(2, size, procs, Arc::new(SingleProcessComm), DeviceContext::emulated()).unwrap();
        let id = gs.create_grid(&GridShape::new(ElementType::Double, 2, size)).unwrap();
        let values: Vec<f64> = (1..=12).map(|v| v as f64 * 0.5).collect();
        gs.grid_mut(id).unwrap().copyin_local_typed(&values).unwrap();

        let sum = gs.reduce_grid(ReduceOp::Sum, id).unwrap();
        assert_eq!(sum.num_elements, 12);
        assert_relative_eq!(sum.value.as_f64(), 39.0);
        let max = gs.reduce_grid(ReduceOp::Max, id).unwrap();
        assert_eq!(max.value, Scalar::F64(6.0));
    }
}
