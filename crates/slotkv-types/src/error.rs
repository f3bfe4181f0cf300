use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("malformed block id: {0}")]
    InvalidBlockId(String),

    #[error("invalid slot range ({begin}, {end})")]
    InvalidSlotRange { begin: i32, end: i32 },

    #[error("unknown operation: {0}")]
    UnknownOp(String),

    #[error("unknown chain role: {0}")]
    UnknownRole(i32),
}
