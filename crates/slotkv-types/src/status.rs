use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chain::{ReplicaChain, StorageMode};
use crate::slot::{SlotRange, SLOT_MAX};

/// File flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFlags(pub u32);

impl DataFlags {
    /// Never released on lease expiry.
    pub const PINNED: u32 = 0x01;
    /// Fixed number of partitions; disables auto-scaling.
    pub const STATIC_PROVISIONED: u32 = 0x02;
    /// Written back to the backing path on lease expiry.
    pub const MAPPED: u32 = 0x04;

    pub fn is_pinned(&self) -> bool {
        self.0 & Self::PINNED != 0
    }

    pub fn is_static_provisioned(&self) -> bool {
        self.0 & Self::STATIC_PROVISIONED != 0
    }

    pub fn is_mapped(&self) -> bool {
        self.0 & Self::MAPPED != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// Per-file data layout: the ordered list of replica chains.
///
/// Chains are kept sorted by slot begin so a key's chain can be found by
/// binary search on its hash slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStatus {
    pub backing_path: String,
    pub chain_length: usize,
    pub chains: Vec<ReplicaChain>,
    pub flags: DataFlags,
    pub tags: BTreeMap<String, String>,
}

impl DataStatus {
    pub fn new(backing_path: impl Into<String>, chain_length: usize, chains: Vec<ReplicaChain>, flags: DataFlags) -> Self {
        Self {
            backing_path: backing_path.into(),
            chain_length,
            chains,
            flags,
            tags: BTreeMap::new(),
        }
    }

    /// Initial slot layout for a file with `num_blocks` partitions.
    ///
    /// Each partition gets `SLOT_MAX / num_blocks` slots; the last one runs to
    /// `SLOT_MAX`.
    pub fn initial_layout(num_blocks: usize) -> Vec<SlotRange> {
        if num_blocks == 0 {
            return Vec::new();
        }
        let per_block = SLOT_MAX as usize / num_blocks;
        (0..num_blocks)
            .map(|i| {
                let begin = (i * per_block) as i32;
                let end = if i == num_blocks - 1 {
                    SLOT_MAX
                } else {
                    ((i + 1) * per_block - 1) as i32
                };
                SlotRange { begin, end }
            })
            .collect()
    }

    /// Index of the chain whose range starts at or before `slot`.
    pub fn chain_index_for_slot(&self, slot: i32) -> Option<usize> {
        let upper = self.chains.partition_point(|c| c.slot_range.begin <= slot);
        upper.checked_sub(1)
    }

    pub fn chain_for_slot(&self, slot: i32) -> Option<&ReplicaChain> {
        self.chain_index_for_slot(slot).map(|i| &self.chains[i])
    }

    /// Index of the chain with exactly this slot range.
    pub fn find_range(&self, range: SlotRange) -> Option<usize> {
        self.chains.iter().position(|c| c.slot_range == range)
    }

    pub fn find_chain(&self, chain: &ReplicaChain) -> Option<usize> {
        self.chains.iter().position(|c| c == chain)
    }

    pub fn set_mode(&mut self, mode: StorageMode) {
        for chain in &mut self.chains {
            chain.mode = mode;
        }
    }

    /// Returns `true` if the chains tile `[0, SLOT_MAX]` without gaps or overlap.
    pub fn is_tiled(&self) -> bool {
        let mut expected = 0;
        for chain in &self.chains {
            if chain.slot_range.begin != expected || chain.slot_range.end < chain.slot_range.begin {
                return false;
            }
            expected = chain.slot_range.end + 1;
        }
        expected == SLOT_MAX + 1
    }
}
