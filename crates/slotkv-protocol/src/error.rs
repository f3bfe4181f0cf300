use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: &'static str, actual: &'static str },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("no such block: {0}")]
    BlockNotFound(String),

    #[error("remote error: code={code}, message={message}")]
    RemoteError { code: u32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns `true` if the failure is in the transport rather than the peer's logic.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Timeout(_) | Self::Io(_) | Self::FramingError(_)
        )
    }
}

/// Error codes carried by [`ProtocolError::RemoteError`].
pub mod codes {
    pub const STORAGE: u32 = 1;
    pub const DIRECTORY: u32 = 2;
    pub const NOT_FOUND: u32 = 404;
    pub const INTERNAL: u32 = 500;
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
