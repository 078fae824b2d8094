use thiserror::Error;

use crate::index::IndexArray;

#[derive(Debug, Error)]
pub enum HaloError {
    #[error("cannot create {requested}-d grid in {available}-d grid space")]
    DimensionMismatch { requested: usize, available: usize },

    #[error("unsupported dimension count: {0}")]
    UnsupportedDimensions(usize),

    #[error("diagonal halo exchange requires 2 or 3 dimensions, grid has {num_dims}")]
    InvalidDiagonal { num_dims: usize },

    #[error("failed to allocate {bytes} bytes of {kind} memory")]
    Allocation { bytes: usize, kind: &'static str },

    #[error("unknown grid id {0}")]
    UnknownGrid(i32),

    #[error("index {index:?} is outside the local partition and the halo of dimension {dim}")]
    OutOfHalo { index: IndexArray, dim: usize },

    #[error(
        "halo width {width} in dimension {dim} exceeds the neighbor partition \
         (local offset {local_offset}, local size {local_size}, rank {rank})"
    )]
    HaloTooWide {
        dim: usize,
        width: usize,
        local_offset: i64,
        local_size: i64,
        rank: usize,
    },

    #[error("grid {0} was saved and holds no buffers until it is restored")]
    NoBuffers(i32),

    #[error("grid {0} has an active remote grid; read through the remote grid instead")]
    RemoteGridActive(i32),

    #[error("element type mismatch: grid holds {expected}, access used {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {found}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("process grid error: {0}")]
    ProcessGrid(String),

    #[error("communication error: {0}")]
    Comm(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HaloError>;
