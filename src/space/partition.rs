//! Block decomposition of the grid space over a process grid.
//!
//! Every rank computes the same decomposition without communication: the
//! `n` points of a dimension split over `p` process coordinates give each
//! coordinate `n / p` points, the first `n % p` coordinates one more.
//! Ranks are numbered with process dimension 0 fastest.

use std::fmt;
use std::str::FromStr;

use nom::character::complete::{char, digit1, space0};
use nom::combinator::{all_consuming, map_res};
use nom::multi::separated_list1;
use nom::sequence::delimited;
use nom::IResult;
use nom::Parser;

use crate::error::{HaloError, Result};
use crate::index::{intersect, IndexArray, MAX_DIMS};

/// Logical arrangement of ranks into an N-d grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessGrid {
    shape: [usize; MAX_DIMS],
    num_dims: usize,
}

impl ProcessGrid {
    pub fn new(shape: &[usize]) -> Result<Self> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(HaloError::ProcessGrid(format!(
                "process grid must have 1 to {MAX_DIMS} dimensions, got {}",
                shape.len()
            )));
        }
        if shape.contains(&0) {
            return Err(HaloError::ProcessGrid(format!("zero-sized process dimension in {shape:?}")));
        }
        let mut full = [1; MAX_DIMS];
        full[..shape.len()].copy_from_slice(shape);
        Ok(Self {
            shape: full,
            num_dims: shape.len(),
        })
    }

    /// Balanced factorisation of `num_procs` over `num_dims` dimensions.
    /// Prime factors, largest first, go to the dimension with the most
    /// points per process.
    pub fn auto(num_procs: usize, num_dims: usize, global_size: &IndexArray) -> Result<Self> {
        if num_procs == 0 {
            return Err(HaloError::ProcessGrid("no processes".into()));
        }
        if num_dims == 0 || num_dims > MAX_DIMS {
            return Err(HaloError::UnsupportedDimensions(num_dims));
        }
        let mut shape = vec![1usize; num_dims];
        for f in prime_factors(num_procs).into_iter().rev() {
            let target = (0..num_dims)
                .max_by(|&a, &b| {
                    let la = global_size[a] as f64 / shape[a] as f64;
                    let lb = global_size[b] as f64 / shape[b] as f64;
                    // Ties go to the lower dimension.
                    la.total_cmp(&lb).then(b.cmp(&a))
                })
                .unwrap_or(0);
            shape[target] *= f;
        }
        Self::new(&shape)
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape[..self.num_dims]
    }

    /// Extent along `dim`; 1 beyond the grid's dimensionality.
    pub fn extent(&self, dim: usize) -> usize {
        self.shape[dim]
    }

    pub fn num_procs(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn coords(&self, rank: usize) -> [usize; MAX_DIMS] {
        let mut c = [0; MAX_DIMS];
        let mut r = rank;
        for (d, coord) in c.iter_mut().enumerate() {
            *coord = r % self.shape[d];
            r /= self.shape[d];
        }
        c
    }

    pub fn rank_of(&self, coords: &[usize; MAX_DIMS]) -> usize {
        (0..MAX_DIMS).rev().fold(0, |acc, d| acc * self.shape[d] + coords[d])
    }
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut f = 2;
    while f * f <= n {
        while n % f == 0 {
            out.push(f);
            n /= f;
        }
        f += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out
}

/// `x`-separated extents such as `"2x2x2"` or `"64x32"`.
pub(crate) fn extents(input: &str) -> IResult<&str, Vec<usize>> {
    all_consuming(delimited(
        space0,
        separated_list1(char('x'), map_res(digit1, str::parse::<usize>)),
        space0,
    ))
    .parse(input)
}

impl FromStr for ProcessGrid {
    type Err = HaloError;

    /// Parse `"2x2x2"` (or `"4"`, `"2x3"`).
    fn from_str(s: &str) -> Result<Self> {
        let (_, shape) =
            extents(s).map_err(|e| HaloError::ProcessGrid(format!("invalid process grid '{s}': {e}")))?;
        Self::new(&shape)
    }
}

impl fmt::Display for ProcessGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.shape().iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join("x"))
    }
}

/// Offset and size of the `coord`-th of `parts` blocks of `n` points.
pub fn block_range(n: i64, parts: usize, coord: usize) -> (i64, i64) {
    let parts = parts as i64;
    let coord = coord as i64;
    let base = n / parts;
    let rem = n % parts;
    let offset = coord * base + coord.min(rem);
    let size = base + i64::from(coord < rem);
    (offset, size)
}

/// Deterministic mapping of the grid space onto a process grid.
#[derive(Clone, Debug)]
pub struct Decomposition {
    num_dims: usize,
    global_size: IndexArray,
    procs: ProcessGrid,
}

impl Decomposition {
    pub fn new(num_dims: usize, global_size: IndexArray, procs: ProcessGrid) -> Result<Self> {
        if num_dims == 0 || num_dims > MAX_DIMS {
            return Err(HaloError::UnsupportedDimensions(num_dims));
        }
        if procs.num_dims() > num_dims {
            return Err(HaloError::ProcessGrid(format!(
                "{}-d process grid for a {num_dims}-d space",
                procs.num_dims()
            )));
        }
        Ok(Self {
            num_dims,
            global_size: IndexArray::from_slice(&global_size.0[..num_dims], 1),
            procs,
        })
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn global_size(&self) -> IndexArray {
        self.global_size
    }

    pub fn procs(&self) -> &ProcessGrid {
        &self.procs
    }

    /// The space block owned by the process at `coords`.
    pub fn space_partition(&self, coords: &[usize; MAX_DIMS]) -> (IndexArray, IndexArray) {
        let mut offset = IndexArray::default();
        let mut size = IndexArray::splat(1);
        for d in 0..self.num_dims {
            let (o, s) = block_range(self.global_size[d], self.procs.extent(d), coords[d]);
            offset[d] = o;
            size[d] = s;
        }
        (offset, size)
    }

    /// The part of a grid covering `[grid_offset, grid_offset + grid_size)`
    /// that falls into the block of the process at `coords`.
    pub fn grid_partition(
        &self,
        coords: &[usize; MAX_DIMS],
        grid_offset: &IndexArray,
        grid_size: &IndexArray,
    ) -> (IndexArray, IndexArray) {
        let (offset, size) = self.space_partition(coords);
        intersect(&offset, &size, grid_offset, grid_size)
    }

    /// Extent of a grid's partition along `dim` at process coordinate `coord`.
    pub fn grid_range(&self, dim: usize, coord: usize, grid_offset: &IndexArray, grid_size: &IndexArray) -> (i64, i64) {
        let (o, s) = block_range(self.global_size[dim], self.procs.extent(dim), coord);
        let lo = o.max(grid_offset[dim]);
        let hi = (o + s).min(grid_offset[dim] + grid_size[dim]);
        (lo, (hi - lo).max(0))
    }

    /// Rank of the nearest process along `dim` (towards higher coordinates
    /// if `forward`) whose partition of the grid is non-empty. Wraps around
    /// when `periodic`, possibly back to the caller itself.
    pub fn neighbor(
        &self,
        coords: &[usize; MAX_DIMS],
        dim: usize,
        forward: bool,
        periodic: bool,
        grid_offset: &IndexArray,
        grid_size: &IndexArray,
    ) -> Option<usize> {
        let p = self.procs.extent(dim);
        let c = coords[dim];
        let nonempty = |k: usize| self.grid_range(dim, k, grid_offset, grid_size).1 > 0;
        let mut candidates: Box<dyn Iterator<Item = usize>> = match (forward, periodic) {
            (true, false) => Box::new(c + 1..p),
            (false, false) => Box::new((0..c).rev()),
            (true, true) => Box::new((1..=p).map(move |s| (c + s) % p)),
            (false, true) => Box::new((1..=p).map(move |s| (c + p - s) % p)),
        };
        candidates.find(|&k| nonempty(k)).map(|k| {
            let mut n = *coords;
            n[dim] = k;
            self.procs.rank_of(&n)
        })
    }

    /// Ranks whose grid partition intersects the box `[offset, offset + size)`,
    /// with the intersection.
    pub fn owners(
        &self,
        offset: &IndexArray,
        size: &IndexArray,
        grid_offset: &IndexArray,
        grid_size: &IndexArray,
    ) -> Vec<(usize, IndexArray, IndexArray)> {
        (0..self.procs.num_procs())
            .filter_map(|rank| {
                let coords = self.procs.coords(rank);
                let (po, ps) = self.grid_partition(&coords, grid_offset, grid_size);
                let (io, is) = intersect(&po, &ps, offset, size);
                (!is.is_degenerate(self.num_dims)).then_some((rank, io, is))
            })
            .collect()
    }
}
