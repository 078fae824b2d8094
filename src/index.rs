//! Fixed-size coordinate arrays and sub-region copy helpers.
//!
//! All multi-dimensional buffers in the runtime store dimension 0 as the
//! fastest-varying index. A region of logical size `S` with a row pitch of
//! `P` elements places `(i0, i1, i2)` at `i0 + i1 * P + i2 * P * S[1]`.

use std::fmt;
use std::ops::{Add, Index, IndexMut, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Maximum number of grid dimensions handled by the exchange engine.
pub const MAX_DIMS: usize = 3;

/// Per-dimension halo widths.
pub type WidthArray = [usize; MAX_DIMS];

/// A point or extent in the global index space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexArray(pub [i64; MAX_DIMS]);

impl IndexArray {
    pub const fn new(i0: i64, i1: i64, i2: i64) -> Self {
        Self([i0, i1, i2])
    }

    pub const fn splat(v: i64) -> Self {
        Self([v; MAX_DIMS])
    }

    /// Build from a slice, filling the missing trailing dimensions with `fill`.
    pub fn from_slice(values: &[i64], fill: i64) -> Self {
        let mut out = Self::splat(fill);
        for (dst, &v) in out.0.iter_mut().zip(values) {
            *dst = v;
        }
        out
    }

    pub fn from_widths(widths: &WidthArray) -> Self {
        Self(widths.map(|w| w as i64))
    }

    /// Product of the first `num_dims` entries.
    pub fn accumulate(&self, num_dims: usize) -> i64 {
        self.0[..num_dims].iter().product()
    }

    pub fn set_no_less_than(&mut self, floor: i64) {
        for v in self.0.iter_mut() {
            *v = (*v).max(floor);
        }
    }

    pub fn set_no_more_than(&mut self, ceiling: &IndexArray) {
        for (v, &c) in self.0.iter_mut().zip(ceiling.0.iter()) {
            *v = (*v).min(c);
        }
    }

    /// True if any of the first `num_dims` extents is zero or negative.
    pub fn is_degenerate(&self, num_dims: usize) -> bool {
        self.0[..num_dims].iter().any(|&v| v <= 0)
    }

    /// Whether `point` lies inside the box `[self, self + size)`.
    pub fn contains(&self, size: &IndexArray, point: &IndexArray, num_dims: usize) -> bool {
        (0..num_dims).all(|d| point[d] >= self[d] && point[d] < self[d] + size[d])
    }

    pub fn iter(&self) -> impl Iterator<Item = &i64> {
        self.0.iter()
    }
}

impl Index<usize> for IndexArray {
    type Output = i64;
    fn index(&self, i: usize) -> &i64 {
        &self.0[i]
    }
}

impl IndexMut<usize> for IndexArray {
    fn index_mut(&mut self, i: usize) -> &mut i64 {
        &mut self.0[i]
    }
}

impl Add for IndexArray {
    type Output = IndexArray;
    fn add(self, rhs: IndexArray) -> IndexArray {
        IndexArray(std::array::from_fn(|i| self.0[i] + rhs.0[i]))
    }
}

impl Sub for IndexArray {
    type Output = IndexArray;
    fn sub(self, rhs: IndexArray) -> IndexArray {
        IndexArray(std::array::from_fn(|i| self.0[i] - rhs.0[i]))
    }
}

impl Add<i64> for IndexArray {
    type Output = IndexArray;
    fn add(self, rhs: i64) -> IndexArray {
        IndexArray(self.0.map(|v| v + rhs))
    }
}

impl Sub<i64> for IndexArray {
    type Output = IndexArray;
    fn sub(self, rhs: i64) -> IndexArray {
        IndexArray(self.0.map(|v| v - rhs))
    }
}

impl Mul<i64> for IndexArray {
    type Output = IndexArray;
    fn mul(self, rhs: i64) -> IndexArray {
        IndexArray(self.0.map(|v| v * rhs))
    }
}

impl fmt::Display for IndexArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

/// Intersection of two boxes, as `(offset, size)`. Size entries are clamped at zero.
pub fn intersect(
    a_offset: &IndexArray,
    a_size: &IndexArray,
    b_offset: &IndexArray,
    b_size: &IndexArray,
) -> (IndexArray, IndexArray) {
    let mut offset = IndexArray::default();
    let mut size = IndexArray::default();
    for d in 0..MAX_DIMS {
        let lo = a_offset[d].max(b_offset[d]);
        let hi = (a_offset[d] + a_size[d]).min(b_offset[d] + b_size[d]);
        offset[d] = lo;
        size[d] = (hi - lo).max(0);
    }
    (offset, size)
}

/// Linear element offset of `index` in a buffer of extent `size` whose rows
/// are `pitch` elements apart.
pub fn linear_offset(index: &IndexArray, size: &IndexArray, pitch: i64) -> i64 {
    index[0] + index[1] * pitch + index[2] * pitch * size[1]
}

/// Visit every row (run along dimension 0) of a box of extent `size`,
/// outermost dimension slowest. The callback gets the coordinates of the
/// row's first element relative to the box origin.
pub fn for_each_row(size: &IndexArray, num_dims: usize, mut f: impl FnMut(IndexArray)) {
    if size.is_degenerate(num_dims) {
        return;
    }
    let n1 = if num_dims > 1 { size[1] } else { 1 };
    let n2 = if num_dims > 2 { size[2] } else { 1 };
    for i2 in 0..n2 {
        for i1 in 0..n1 {
            f(IndexArray::new(0, i1, i2));
        }
    }
}

/// Copy the sub-region `[sub_offset, sub_offset + sub_size)` of a packed
/// array of extent `grid_size` into the packed buffer `sub`.
pub fn copyout_subgrid(
    elm_size: usize,
    num_dims: usize,
    grid: &[u8],
    grid_size: &IndexArray,
    sub: &mut [u8],
    sub_offset: &IndexArray,
    sub_size: &IndexArray,
) {
    let row = sub_size[0] as usize * elm_size;
    let mut dst = 0usize;
    for_each_row(sub_size, num_dims, |r| {
        let src = linear_offset(&(*sub_offset + r), grid_size, grid_size[0]) as usize * elm_size;
        sub[dst..dst + row].copy_from_slice(&grid[src..src + row]);
        dst += row;
    });
}

/// Inverse of [`copyout_subgrid`].
pub fn copyin_subgrid(
    elm_size: usize,
    num_dims: usize,
    grid: &mut [u8],
    grid_size: &IndexArray,
    sub: &[u8],
    sub_offset: &IndexArray,
    sub_size: &IndexArray,
) {
    let row = sub_size[0] as usize * elm_size;
    let mut src = 0usize;
    for_each_row(sub_size, num_dims, |r| {
        let dst = linear_offset(&(*sub_offset + r), grid_size, grid_size[0]) as usize * elm_size;
        grid[dst..dst + row].copy_from_slice(&sub[src..src + row]);
        src += row;
    });
}
