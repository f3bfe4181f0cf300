use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::{BlockId, ChainRole};
use crate::slot::SlotRange;

/// Directory-side migration status of a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainStatus {
    #[default]
    Stable,
    Exporting,
    Importing,
}

/// Where a chain's data currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    #[default]
    InMemory,
    InMemoryGrace,
    OnDisk,
}

/// One replicated partition of a file, as tracked by the directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaChain {
    pub blocks: Vec<BlockId>,
    pub slot_range: SlotRange,
    pub status: ChainStatus,
    pub mode: StorageMode,
}

impl ReplicaChain {
    pub fn new(blocks: Vec<BlockId>, slot_range: SlotRange) -> Self {
        Self {
            blocks,
            slot_range,
            status: ChainStatus::Stable,
            mode: StorageMode::InMemory,
        }
    }

    pub fn head(&self) -> Option<&BlockId> {
        self.blocks.first()
    }

    pub fn tail(&self) -> Option<&BlockId> {
        self.blocks.last()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Role and successor of the block at `index`.
    pub fn wiring(&self, index: usize) -> (ChainRole, Option<&BlockId>) {
        (
            ChainRole::for_position(index, self.blocks.len()),
            self.blocks.get(index + 1),
        )
    }

    pub fn is_migrating(&self) -> bool {
        self.status != ChainStatus::Stable
    }
}

// Two chains are the same chain if they name the same blocks over the same
// slots; status and mode are transient.
impl PartialEq for ReplicaChain {
    fn eq(&self, other: &Self) -> bool {
        self.blocks == other.blocks && self.slot_range == other.slot_range
    }
}

impl Eq for ReplicaChain {}

impl fmt::Display for ReplicaChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.blocks.iter().map(|b| b.to_string()).collect();
        write!(f, "<{}> :: {} :: {:?}", names.join(", "), self.slot_range, self.mode)
    }
}
