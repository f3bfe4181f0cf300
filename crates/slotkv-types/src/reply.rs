//! In-band reply codes.
//!
//! Partitions answer every per-key operation with a plain string. Values are
//! returned verbatim; status codes start with `!`. The exporting redirect
//! carries the target chain as `!exporting!<block>!<block>...`.

use crate::block::BlockId;
use crate::error::TypeError;

pub const OK: &str = "!ok";
pub const KEY_NOT_FOUND: &str = "!key_not_found";
pub const DUPLICATE_KEY: &str = "!duplicate_key";
pub const BLOCK_MOVED: &str = "!block_moved";
pub const ARGS_ERROR: &str = "!args_error";
pub const BLOCK_NOT_LOCKED: &str = "!block_not_locked";
pub const EXPORTING_PREFIX: &str = "!exporting!";

/// Trailing argument marking traffic redirected from an exporting block.
pub const REDIRECTED: &str = "!redirected";

/// Build an exporting redirect naming the target chain.
pub fn exporting(target: &[BlockId]) -> String {
    format!("{EXPORTING_PREFIX}{}", BlockId::join_chain(target))
}

/// Typed view of a single partition reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
    KeyNotFound,
    DuplicateKey,
    BlockMoved,
    /// Re-issue the identical operation against this chain, marked redirected.
    Exporting(Vec<BlockId>),
    ArgsError,
    BlockNotLocked,
}

impl Reply {
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        Ok(match raw {
            OK => Self::Ok,
            KEY_NOT_FOUND => Self::KeyNotFound,
            DUPLICATE_KEY => Self::DuplicateKey,
            BLOCK_MOVED => Self::BlockMoved,
            ARGS_ERROR => Self::ArgsError,
            BLOCK_NOT_LOCKED => Self::BlockNotLocked,
            s => match s.strip_prefix(EXPORTING_PREFIX) {
                Some(chain) => Self::Exporting(BlockId::parse_chain(chain)?),
                None => Self::Value(s.to_string()),
            },
        })
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Exporting(_) | Self::BlockMoved)
    }
}
