use std::time::Duration;

use slotkv_protocol::ProtocolError;
use slotkv_types::TypeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    /// The cached routing table is stale, or the chain reported a protocol
    /// violation. Refresh from the directory before retrying.
    #[error("block moved")]
    BlockMoved,

    #[error("block is not locked")]
    BlockNotLocked,

    #[error("invalid arguments")]
    ArgsError,

    #[error("replica chain has no blocks")]
    EmptyChain,

    #[error("empty response")]
    EmptyResponse,

    #[error("no chain owns slot {0}")]
    NoChainForSlot(i32),

    #[error("gave up after {0} redirects")]
    TooManyRedirects(usize),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl ClientError {
    /// Transport failures are retried after chain repair; everything else is
    /// surfaced to the caller.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Protocol(e) => e.is_transport(),
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
