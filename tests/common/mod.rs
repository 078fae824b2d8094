#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use halocline::comm::LocalComm;
use halocline::device::DeviceContext;
use halocline::grid::Grid;
use halocline::space::ProcessGrid;
use halocline::{GridSpace, IndexArray, RuntimeConfig};

/// Run `body` on every rank of the process grid `procs`, one thread per
/// rank, and collect the results in rank order.
pub fn run_ranks<T, F>(procs: &str, num_dims: usize, global_size: IndexArray, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(GridSpace) -> T + Send + Sync + 'static,
{
    let procs: ProcessGrid = procs.parse().unwrap();
    let body = Arc::new(body);
    let ctx = DeviceContext::emulated();
    let handles: Vec<_> = LocalComm::universe(procs.num_procs())
        .into_iter()
        .map(|comm| {
            let body = body.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                let space = RuntimeConfig::new(num_dims, global_size)
                    .with_proc_grid(procs)
                    .build_space_on(Arc::new(comm), ctx)
                    .unwrap();
                body(space)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Linear index of `p` in a packed array of extent `size`, dimension 0
/// fastest.
pub fn global_index(p: &IndexArray, size: &IndexArray) -> i64 {
    p[0] + p[1] * size[0] + p[2] * size[0] * size[1]
}

/// Global positions of the local partition in memory order.
pub fn local_points(grid: &Grid) -> Vec<IndexArray> {
    let lo = grid.local_offset();
    let ls = grid.local_size();
    let mut out = Vec::new();
    if grid.is_empty() {
        return out;
    }
    for i2 in 0..ls[2] {
        for i1 in 0..ls[1] {
            for i0 in 0..ls[0] {
                out.push(lo + IndexArray::new(i0, i1, i2));
            }
        }
    }
    out
}

/// Fill a float grid so every element holds its global linear index
/// relative to the grid origin.
pub fn fill_with_index(grid: &mut Grid) {
    let size = grid.size();
    let goff = grid.global_offset();
    let values: Vec<f32> = local_points(grid)
        .iter()
        .map(|p| global_index(&(*p - goff), &size) as f32)
        .collect();
    grid.copyin_local_typed(&values).unwrap();
}

/// Whether `p` lies inside the grid's global extent.
pub fn in_domain(grid: &Grid, p: &IndexArray) -> bool {
    let goff = grid.global_offset();
    let size = grid.size();
    (0..grid.num_dims()).all(|d| p[d] >= goff[d] && p[d] < goff[d] + size[d])
}

/// Every position within `width` of the local partition, including the
/// partition itself.
pub fn extended_points(grid: &Grid, width: i64) -> Vec<IndexArray> {
    let nd = grid.num_dims();
    let lo = grid.local_offset();
    let ls = grid.local_size();
    let range = |d: usize| {
        if d < nd {
            lo[d] - width..lo[d] + ls[d] + width
        } else {
            0..1
        }
    };
    let mut out = Vec::new();
    for i2 in range(2) {
        for i1 in range(1) {
            for i0 in range(0) {
                out.push(IndexArray::new(i0, i1, i2));
            }
        }
    }
    out
}

/// Number of dimensions in which `p` lies outside the local partition.
pub fn dims_outside(grid: &Grid, p: &IndexArray) -> usize {
    let lo = grid.local_offset();
    let ls = grid.local_size();
    (0..grid.num_dims()).filter(|&d| p[d] < lo[d] || p[d] >= lo[d] + ls[d]).count()
}
