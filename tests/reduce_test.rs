//! Global reductions over partitioned grids.

mod common;

use approx::assert_relative_eq;
use common::run_ranks;
use halocline::{ElementType, GridShape, IndexArray, ReduceOp, Scalar};

#[test]
fn integer_reductions_over_three_ranks() {
    let size = IndexArray::new(10, 1, 1);
    let results = run_ranks("3", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Long, 1, size)).unwrap();
        let grid = gs.grid_mut(id).unwrap();
        let lo = grid.local_offset()[0];
        let values: Vec<i64> = (lo + 1..=lo + grid.local_size()[0]).collect();
        grid.copyin_local_typed(&values).unwrap();
        [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min, ReduceOp::Prod].map(|op| gs.reduce_grid(op, id).unwrap())
    });
    for [sum, max, min, prod] in results {
        assert_eq!(sum.value, Scalar::I64(55));
        assert_eq!(sum.num_elements, 10);
        assert_eq!(max.value, Scalar::I64(10));
        assert_eq!(min.value, Scalar::I64(1));
        assert_eq!(prod.value, Scalar::I64(3_628_800));
    }
}

#[test]
fn empty_ranks_contribute_the_identity() {
    // Only rank 0 holds any part of the 2-point grid.
    let space = IndexArray::new(8, 1, 1);
    let results = run_ranks("4", 1, space, |mut gs| {
        let id = gs
            .create_grid(&GridShape::new(ElementType::Float, 1, IndexArray::new(2, 1, 1)))
            .unwrap();
        gs.grid_mut(id).unwrap().copyin_local_typed(&[-1.5f32, -0.25]).unwrap();
        (
            gs.reduce_grid(ReduceOp::Sum, id).unwrap(),
            gs.reduce_grid(ReduceOp::Max, id).unwrap(),
            gs.reduce_grid(ReduceOp::Prod, id).unwrap(),
        )
    });
    for (sum, max, prod) in results {
        assert_relative_eq!(sum.value.as_f64(), -1.75);
        assert_eq!(max.value, Scalar::F32(-0.25));
        assert_relative_eq!(prod.value.as_f64(), 0.375);
        assert_eq!(sum.num_elements, 2);
    }
}

#[test]
fn double_sum_over_2d_blocks() {
    let size = IndexArray::new(6, 6, 1);
    let results = run_ranks("2x3", 2, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Double, 2, size)).unwrap();
        let grid = gs.grid_mut(id).unwrap();
        let n = grid.num_elements();
        grid.copyin_local_typed(&vec![0.1f64; n]).unwrap();
        gs.reduce_grid(ReduceOp::Sum, id).unwrap().value.as_f64()
    });
    for sum in results {
        assert_relative_eq!(sum, 3.6, epsilon = 1e-12);
    }
}
