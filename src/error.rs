//! Error types for the shard store.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by store, sort, and query operations.
///
/// Input-level problems (an unparsable line, an out-of-range coordinate) are
/// not errors: the offending record is skipped with a warning and counted in
/// [`crate::StoreStats`]. Everything here is fatal to the operation that
/// returned it; nothing is retried.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: unknown format version {version:?}")]
    UnknownVersion { path: PathBuf, version: String },

    #[error("{path}: malformed descriptor")]
    BadDescriptor { path: PathBuf },

    #[error("mismatched encoding between {a} and {b}")]
    DescriptorMismatch { a: PathBuf, b: PathBuf },

    #[error("{path}: file size {len} is not a multiple of the {width}-byte record width")]
    TruncatedShard {
        path: PathBuf,
        len: u64,
        width: usize,
    },

    #[error("tile x={x} y={y} out of range for zoom {z}")]
    InvalidTile { z: u32, x: u32, y: u32 },

    #[error("extra pool reference out of bounds at offset {offset}")]
    Pool { offset: u64 },

    #[error("extra pool grew past the 40-bit offset limit")]
    PoolFull,

    #[error("merge ran out of live shard cursors unexpectedly")]
    CursorInvariant,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
