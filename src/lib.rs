//! Halo-exchange runtime for distributed stencil grids.
//!
//! A [`GridSpace`] decomposes an N-d index space (N ≤ 3) over a grid of
//! ranks. Each rank holds its partition of every [`Grid`] in device memory,
//! plus halo copies of its neighbors' boundary planes refreshed by
//! [`GridSpace::exchange_boundaries`].

pub mod buffer;
pub mod comm;
pub mod config;
pub mod device;
pub mod element;
pub mod error;
pub mod grid;
pub mod index;
pub mod profile;
pub mod rpc;
pub mod space;

pub use config::RuntimeConfig;
pub use element::{ElementType, ReduceOp, Scalar};
pub use error::{HaloError, Result};
pub use grid::{Grid, GridId, GridShape};
pub use index::IndexArray;
pub use space::GridSpace;
