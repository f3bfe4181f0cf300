use slotkv_client::ClientError;
use slotkv_protocol::error::codes;
use slotkv_protocol::ProtocolError;
use slotkv_types::TypeError;

/// Errors from storage node operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No block with this number on the node.
    #[error("no such block: {0}")]
    BlockNotFound(u32),

    /// The partition has no operation with this id.
    #[error("no such operation id {0}")]
    UnknownOp(i32),

    /// A request arrived at a chain position that may not serve it.
    #[error("chain protocol violation at {block}: {reason}")]
    ChainViolation { block: String, reason: String },

    /// `export_slots` called on a block that has no export range.
    #[error("block {0} is not exporting")]
    NotExporting(String),

    /// The downstream link is missing where the role requires one.
    #[error("block {0} has no next link")]
    NoNextLink(String),

    /// No directory is attached to this node.
    #[error("no directory configured")]
    NoDirectory,

    /// Snapshot file failed its checksum or framing check.
    #[error("corrupt snapshot {path}: {reason}")]
    CorruptSnapshot { path: String, reason: String },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for ProtocolError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Protocol(inner) => inner,
            StorageError::BlockNotFound(id) => ProtocolError::BlockNotFound(id.to_string()),
            other => ProtocolError::RemoteError {
                code: codes::STORAGE,
                message: other.to_string(),
            },
        }
    }
}
