//! Error types for directory operations.

use thiserror::Error;

use slotkv_protocol::error::codes;
use slotkv_protocol::ProtocolError;
use slotkv_types::{SlotRange, TypeError};

/// Errors that can occur during directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No file at this path.
    #[error("path does not exist: {path}")]
    NotFound { path: String },

    /// A file already exists at this path.
    #[error("path already exists: {path}")]
    AlreadyExists { path: String },

    /// The path is malformed.
    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The file's layout has no chain matching the one given.
    #[error("no such chain for path {path}: {chain}")]
    NoSuchChain { path: String, chain: String },

    /// No chain of the file owns exactly this slot range.
    #[error("no chain with slot range {range} in {path}")]
    NoSuchRange { path: String, range: SlotRange },

    /// The chain is already exporting or importing.
    #[error("chain {range} of {path} is already involved in re-partitioning")]
    AlreadyMigrating { path: String, range: SlotRange },

    /// Merge requested with no usable neighbour.
    #[error("cannot find a merge partner for {range} in {path}")]
    NoMergePartner { path: String, range: SlotRange },

    /// Split requested when no chain can be split further.
    #[error("cannot expand {path} beyond {max} chains")]
    CapacityExhausted { path: String, max: usize },

    /// Every block of a chain failed its liveness probe.
    #[error("all blocks in chain {chain} have failed")]
    AllReplicasFailed { chain: String },

    /// The allocator cannot satisfy the request.
    #[error("insufficient free blocks: requested {requested}, have {available}")]
    InsufficientBlocks { requested: usize, available: usize },

    /// Free blocks exist but not on enough distinct storage nodes.
    #[error("could not find {requested} free blocks on distinct nodes")]
    NoDistinctBlocks { requested: usize },

    /// Blocks handed back that were never allocated.
    #[error("blocks not allocated: {0}")]
    NotAllocated(String),

    /// The block is allocated and cannot be removed from the pool.
    #[error("block is allocated: {0}")]
    BlockInUse(String),

    /// Invalid creation arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A storage node call failed.
    #[error("storage error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

/// Convenience type alias for directory operations.
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

impl From<DirectoryError> for ProtocolError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Protocol(inner) => inner,
            DirectoryError::NotFound { .. } => ProtocolError::RemoteError {
                code: codes::NOT_FOUND,
                message: e.to_string(),
            },
            other => ProtocolError::RemoteError {
                code: codes::DIRECTORY,
                message: other.to_string(),
            },
        }
    }
}
