//! File lifecycle: creation, removal, lease expiry, and moving a file's
//! contents between memory and its backing path.

use tracing::{info, warn};

use slotkv_types::{DataFlags, DataStatus, ReplicaChain, StorageMode, SLOT_MAX};

use crate::error::{DirectoryError, DirectoryResult};
use crate::names::{block_backing_path, validate_path};
use crate::tree::{DirectoryTree, FileState};
use crate::wiring;

impl DirectoryTree {
    /// Create a file of `num_blocks` chains of `chain_length` replicas,
    /// splitting the slot space evenly.
    pub async fn create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> DirectoryResult<DataStatus> {
        validate_path(path)?;
        if num_blocks == 0 || chain_length == 0 {
            return Err(DirectoryError::InvalidArgument(format!(
                "num_blocks ({num_blocks}) and chain_length ({chain_length}) must be positive"
            )));
        }
        if num_blocks > SLOT_MAX as usize {
            return Err(DirectoryError::CapacityExhausted {
                path: path.to_string(),
                max: SLOT_MAX as usize,
            });
        }
        if self.contains(path) {
            return Err(DirectoryError::AlreadyExists { path: path.to_string() });
        }

        let flags = DataFlags(flags);
        let auto_scale = !flags.is_static_provisioned();
        let mut chains = Vec::with_capacity(num_blocks);
        for range in DataStatus::initial_layout(num_blocks) {
            let allocated = self.allocator.allocate(chain_length, &[]);
            let chain = match allocated {
                Ok(blocks) => ReplicaChain::new(blocks, range),
                Err(e) => {
                    self.release(&chains).await;
                    return Err(e);
                }
            };
            chains.push(chain);
            let chain = &chains[chains.len() - 1];
            if let Err(e) = wiring::setup_chain(self.storage.as_ref(), path, chain, range, auto_scale).await {
                self.release(&chains).await;
                return Err(e);
            }
        }

        let status = DataStatus::new(backing_path, chain_length, chains, flags);
        if let Err(e) = self.insert(path, status.clone()) {
            self.release(&status.chains).await;
            return Err(e);
        }
        info!(path, backing_path, num_blocks, chain_length, "file created");
        Ok(status)
    }

    /// Remove a file and free its blocks.
    pub async fn remove(&self, path: &str) -> DirectoryResult<()> {
        let node = self.detach(path)?;
        let state = node.write().await;
        // Blocks of dumped chains were already returned to the pool.
        let live: Vec<ReplicaChain> = state
            .status
            .chains
            .iter()
            .filter(|c| c.mode != StorageMode::OnDisk)
            .cloned()
            .collect();
        self.release(&live).await;
        self.release(&state.adding).await;
        info!(path, "file removed");
        Ok(())
    }

    /// Lease expiry: pinned files keep their blocks; mapped files are written
    /// to their backing path and stay listed; anything else is dropped.
    pub async fn handle_lease_expiry(&self, path: &str) -> DirectoryResult<()> {
        let node = self.file(path)?;
        let mut state = node.write().await;
        let flags = state.status.flags;
        if flags.is_pinned() {
            info!(path, "lease expired on pinned file; keeping it");
            return Ok(());
        }
        if flags.is_mapped() {
            let backing_path = state.status.backing_path.clone();
            self.unload(path, &mut state, &backing_path).await?;
            info!(path, backing_path, "lease expired; file flushed to backing path");
            return Ok(());
        }
        drop(state);
        info!(path, "lease expired; clearing file");
        self.remove(path).await
    }

    /// Write every chain's tail to `backing_path` and release all blocks.
    pub async fn dump(&self, path: &str, backing_path: &str) -> DirectoryResult<()> {
        let node = self.file(path)?;
        let mut state = node.write().await;
        self.unload(path, &mut state, backing_path).await?;
        state.status.backing_path = backing_path.to_string();
        info!(path, backing_path, "file dumped");
        Ok(())
    }

    /// Bring a dumped file back into memory on freshly allocated blocks.
    pub async fn load(&self, path: &str, backing_path: &str) -> DirectoryResult<()> {
        let node = self.file(path)?;
        let mut state = node.write().await;
        let auto_scale = !state.status.flags.is_static_provisioned();
        let chain_length = state.status.chain_length;
        let mut loaded: Vec<ReplicaChain> = Vec::with_capacity(state.status.chains.len());
        for old in &state.status.chains {
            if old.mode != StorageMode::OnDisk {
                loaded.push(old.clone());
                continue;
            }
            let blocks = match self.allocator.allocate(chain_length, &[]) {
                Ok(blocks) => blocks,
                Err(e) => {
                    self.release_loaded(&state.status.chains, &loaded).await;
                    return Err(e);
                }
            };
            let chain = ReplicaChain::new(blocks, old.slot_range);
            let snapshot = block_backing_path(backing_path, &old.slot_range.to_path_component());
            let wired = async {
                wiring::setup_chain(self.storage.as_ref(), path, &chain, old.slot_range, auto_scale).await?;
                for block in &chain.blocks {
                    self.storage.load(block, &snapshot).await?;
                }
                Ok::<_, DirectoryError>(())
            };
            let result = wired.await;
            loaded.push(chain);
            if let Err(e) = result {
                self.release_loaded(&state.status.chains, &loaded).await;
                return Err(e);
            }
        }
        state.status.chains = loaded;
        state.status.backing_path = backing_path.to_string();
        info!(path, backing_path, chains = state.status.chains.len(), "file loaded");
        Ok(())
    }

    /// Flush every chain's tail to `backing_path`, keeping the data in memory.
    pub async fn sync(&self, path: &str, backing_path: &str) -> DirectoryResult<()> {
        let node = self.file(path)?;
        let state = node.read().await;
        for chain in &state.status.chains {
            if chain.mode == StorageMode::OnDisk {
                continue;
            }
            if let Some(tail) = chain.tail() {
                let snapshot = block_backing_path(backing_path, &chain.slot_range.to_path_component());
                self.storage.sync(tail, &snapshot).await?;
            }
        }
        Ok(())
    }

    /// Dump each in-memory chain's tail, reset the other replicas, and free
    /// every block. Chains are left in place with mode `OnDisk`.
    async fn unload(&self, path: &str, state: &mut FileState, backing_path: &str) -> DirectoryResult<()> {
        for chain in state.status.chains.iter_mut() {
            if chain.mode == StorageMode::OnDisk {
                continue;
            }
            let snapshot = block_backing_path(backing_path, &chain.slot_range.to_path_component());
            if let Some((tail, rest)) = chain.blocks.split_last() {
                self.storage.dump(tail, &snapshot).await?;
                for block in rest {
                    self.storage.reset(block).await?;
                }
            }
            if let Err(e) = self.allocator.free(&chain.blocks) {
                warn!(path, error = %e, "freeing dumped blocks");
            }
            chain.mode = StorageMode::OnDisk;
        }
        Ok(())
    }

    /// Undo a partial load: release chains that were allocated for it.
    async fn release_loaded(&self, previous: &[ReplicaChain], loaded: &[ReplicaChain]) {
        let fresh: Vec<ReplicaChain> = loaded
            .iter()
            .zip(previous)
            .filter(|(_, old)| old.mode == StorageMode::OnDisk)
            .map(|(new, _)| new.clone())
            .collect();
        self.release(&fresh).await;
    }

    /// Reset and free the blocks of `chains`, logging failures.
    pub(crate) async fn release(&self, chains: &[ReplicaChain]) {
        for chain in chains {
            if let Err(e) = wiring::reset(self.storage.as_ref(), chain).await {
                warn!(chain = %chain, error = %e, "resetting released blocks");
            }
            if let Err(e) = self.allocator.free(&chain.blocks) {
                warn!(chain = %chain, error = %e, "freeing released blocks");
            }
        }
    }
}
