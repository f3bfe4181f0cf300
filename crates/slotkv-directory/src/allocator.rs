//! Block allocation.
//!
//! The directory owns the pool of blocks every storage node registered.
//! Replicas of one chain must live on distinct storage nodes, so allocation
//! never hands out two blocks with the same node prefix.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use slotkv_types::BlockId;

use crate::error::{DirectoryError, DirectoryResult};

/// Pool of storage blocks available to files.
pub trait BlockAllocator: Send + Sync {
    /// Take `count` free blocks on distinct nodes, none sharing a node with
    /// any block in `exclude`.
    fn allocate(&self, count: usize, exclude: &[BlockId]) -> DirectoryResult<Vec<BlockId>>;

    /// Return allocated blocks to the pool.
    fn free(&self, blocks: &[BlockId]) -> DirectoryResult<()>;

    /// Register new free blocks.
    fn add_blocks(&self, blocks: &[BlockId]);

    /// Withdraw free blocks from the pool.
    fn remove_blocks(&self, blocks: &[BlockId]) -> DirectoryResult<()>;

    fn num_free_blocks(&self) -> usize;

    fn num_allocated_blocks(&self) -> usize;

    fn num_total_blocks(&self) -> usize {
        self.num_free_blocks() + self.num_allocated_blocks()
    }
}

#[derive(Debug, Default)]
struct Pool {
    free: BTreeSet<BlockId>,
    allocated: HashSet<BlockId>,
}

/// Allocates from a random starting point in the free list, skipping blocks
/// on nodes already chosen.
#[derive(Debug, Default)]
pub struct RandomBlockAllocator {
    pool: Mutex<Pool>,
}

impl RandomBlockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: &[BlockId]) -> Self {
        let allocator = Self::new();
        allocator.add_blocks(blocks);
        allocator
    }
}

impl BlockAllocator for RandomBlockAllocator {
    fn allocate(&self, count: usize, exclude: &[BlockId]) -> DirectoryResult<Vec<BlockId>> {
        let mut pool = self.pool.lock().expect("lock poisoned");
        if count > pool.free.len() {
            return Err(DirectoryError::InsufficientBlocks {
                requested: count,
                available: pool.free.len(),
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut prefixes: HashSet<String> = exclude.iter().map(BlockId::node_prefix).collect();
        let start = rand::thread_rng().gen_range(0..pool.free.len());
        let chosen: Vec<BlockId> = pool
            .free
            .iter()
            .cycle()
            .skip(start)
            .take(pool.free.len())
            .filter(|b| prefixes.insert(b.node_prefix()))
            .take(count)
            .cloned()
            .collect();
        if chosen.len() != count {
            return Err(DirectoryError::NoDistinctBlocks { requested: count });
        }

        for block in &chosen {
            pool.free.remove(block);
            pool.allocated.insert(block.clone());
        }
        debug!(count, free = pool.free.len(), "allocated blocks");
        Ok(chosen)
    }

    fn free(&self, blocks: &[BlockId]) -> DirectoryResult<()> {
        let mut pool = self.pool.lock().expect("lock poisoned");
        let mut not_freed = Vec::new();
        for block in blocks {
            if pool.allocated.remove(block) {
                pool.free.insert(block.clone());
            } else {
                not_freed.push(block.to_string());
            }
        }
        if !not_freed.is_empty() {
            return Err(DirectoryError::NotAllocated(not_freed.join("; ")));
        }
        Ok(())
    }

    fn add_blocks(&self, blocks: &[BlockId]) {
        let mut pool = self.pool.lock().expect("lock poisoned");
        pool.free.extend(blocks.iter().cloned());
    }

    fn remove_blocks(&self, blocks: &[BlockId]) -> DirectoryResult<()> {
        let mut pool = self.pool.lock().expect("lock poisoned");
        if let Some(busy) = blocks.iter().find(|b| !pool.free.contains(*b)) {
            return Err(DirectoryError::BlockInUse(busy.to_string()));
        }
        for block in blocks {
            pool.free.remove(block);
        }
        Ok(())
    }

    fn num_free_blocks(&self) -> usize {
        self.pool.lock().expect("lock poisoned").free.len()
    }

    fn num_allocated_blocks(&self) -> usize {
        self.pool.lock().expect("lock poisoned").allocated.len()
    }
}
