use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identity of one storage block.
///
/// Encoded on the wire and in directory metadata as
/// `host:service_port:management_port:notification_port:chain_port:id`.
/// This string is the only handle used across process boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub host: String,
    pub service_port: u16,
    pub management_port: u16,
    pub notification_port: u16,
    pub chain_port: u16,
    pub id: u32,
}

impl BlockId {
    pub fn new(
        host: impl Into<String>,
        service_port: u16,
        management_port: u16,
        notification_port: u16,
        chain_port: u16,
        id: u32,
    ) -> Self {
        Self {
            host: host.into(),
            service_port,
            management_port,
            notification_port,
            chain_port,
            id,
        }
    }

    /// The storage-node part of the identity (everything except the block number).
    ///
    /// Blocks that share a prefix live in the same process.
    pub fn node_prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.host, self.service_port, self.management_port, self.notification_port, self.chain_port
        )
    }

    /// Join a chain into the `!`-delimited form carried in exporting replies.
    pub fn join_chain(chain: &[BlockId]) -> String {
        chain.iter().map(|b| b.to_string()).collect::<Vec<_>>().join("!")
    }

    /// Parse the `!`-delimited chain form. Empty segments are skipped.
    pub fn parse_chain(s: &str) -> Result<Vec<BlockId>, TypeError> {
        s.split('!').filter(|p| !p.is_empty()).map(str::parse).collect()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_prefix(), self.id)
    }
}

impl FromStr for BlockId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 || parts[0].is_empty() {
            return Err(TypeError::InvalidBlockId(s.to_string()));
        }
        let port = |p: &str| p.parse::<u16>().map_err(|_| TypeError::InvalidBlockId(s.to_string()));
        Ok(Self {
            host: parts[0].to_string(),
            service_port: port(parts[1])?,
            management_port: port(parts[2])?,
            notification_port: port(parts[3])?,
            chain_port: port(parts[4])?,
            id: parts[5]
                .parse()
                .map_err(|_| TypeError::InvalidBlockId(s.to_string()))?,
        })
    }
}

/// Position of a block within its replica chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainRole {
    #[default]
    Singleton,
    Head,
    Mid,
    Tail,
}

impl ChainRole {
    /// Role of the block at `index` in a chain of `len` blocks.
    pub fn for_position(index: usize, len: usize) -> Self {
        if len <= 1 {
            Self::Singleton
        } else if index == 0 {
            Self::Head
        } else if index == len - 1 {
            Self::Tail
        } else {
            Self::Mid
        }
    }

    /// Head or singleton: accepts client mutators.
    pub fn is_head(&self) -> bool {
        matches!(self, Self::Head | Self::Singleton)
    }

    /// Tail or singleton: serves accessors and answers clients.
    pub fn is_tail(&self) -> bool {
        matches!(self, Self::Tail | Self::Singleton)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Singleton => 0,
            Self::Head => 1,
            Self::Mid => 2,
            Self::Tail => 3,
        }
    }
}

impl TryFrom<i32> for ChainRole {
    type Error = TypeError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Singleton),
            1 => Ok(Self::Head),
            2 => Ok(Self::Mid),
            3 => Ok(Self::Tail),
            other => Err(TypeError::UnknownRole(other)),
        }
    }
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Singleton => "singleton",
            Self::Head => "head",
            Self::Mid => "mid",
            Self::Tail => "tail",
        };
        write!(f, "{s}")
    }
}

/// Migration state of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    #[default]
    Regular,
    Importing,
    Exporting,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regular => "regular",
            Self::Importing => "importing",
            Self::Exporting => "exporting",
        };
        write!(f, "{s}")
    }
}
