//! Chain repair: dropping failed replicas and attaching new ones.

use tracing::{info, warn};

use slotkv_types::{ChainRole, ReplicaChain};

use crate::error::{DirectoryError, DirectoryResult};
use crate::tree::{DirectoryTree, FileState};
use crate::wiring;

fn locate(state: &FileState, path: &str, chain: &ReplicaChain) -> DirectoryResult<usize> {
    state
        .status
        .chains
        .iter()
        .position(|c| c.blocks == chain.blocks)
        .ok_or_else(|| DirectoryError::NoSuchChain {
            path: path.to_string(),
            chain: chain.to_string(),
        })
}

impl DirectoryTree {
    /// Probe every replica of `chain`, rewire the survivors into a shorter
    /// chain, and return it.
    ///
    /// If a middle replica died while its predecessor lived, requests it had
    /// not yet passed on are replayed from the new head.
    pub async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> DirectoryResult<ReplicaChain> {
        let node = self.file(path)?;
        let mut state = node.write().await;
        let index = locate(&state, path, chain)?;
        let current = state.status.chains[index].clone();

        let mut survivors = Vec::with_capacity(current.len());
        let mut mid_failure = false;
        let mut prev_failed = false;
        for (i, block) in current.blocks.iter().enumerate() {
            match self.storage.ping(block).await {
                Ok(()) => {
                    survivors.push(block.clone());
                    prev_failed = false;
                }
                Err(e) => {
                    warn!(path, %block, error = %e, "replica unreachable");
                    if i > 0 && i + 1 < current.len() && !prev_failed {
                        mid_failure = true;
                    }
                    prev_failed = true;
                }
            }
        }

        if survivors.is_empty() {
            return Err(DirectoryError::AllReplicasFailed { chain: current.to_string() });
        }
        if survivors.len() == current.len() {
            return Ok(current);
        }

        let slot_range = self.storage.slot_range(&survivors[0]).await?;
        let auto_scale = !state.status.flags.is_static_provisioned();
        let mut repaired = current.clone();
        repaired.blocks = survivors;
        wiring::setup_chain(self.storage.as_ref(), path, &repaired, slot_range, auto_scale).await?;
        if mid_failure {
            if let Some(head) = repaired.head() {
                self.storage.resend_pending(head).await?;
            }
        }

        state.status.chains[index] = repaired.clone();
        info!(path, from = %current, to = %repaired, mid_failure, "chain repaired");
        Ok(repaired)
    }

    /// Append a freshly allocated replica to the tail of `chain`.
    ///
    /// The new block is wired as the tail, the old tail streams its whole
    /// partition to it, and only then starts forwarding live traffic.
    pub async fn add_replica_to_chain(&self, path: &str, chain: &ReplicaChain) -> DirectoryResult<ReplicaChain> {
        let storage = self.storage.as_ref();
        let node = self.file(path)?;
        let mut state = node.write().await;
        let index = locate(&state, path, chain)?;
        let current = state.status.chains[index].clone();
        if current.is_migrating() {
            return Err(DirectoryError::AlreadyMigrating {
                path: path.to_string(),
                range: current.slot_range,
            });
        }
        let Some(old_tail) = current.tail().cloned() else {
            return Err(DirectoryError::NoSuchChain {
                path: path.to_string(),
                chain: current.to_string(),
            });
        };

        let replica = self
            .allocator
            .allocate(1, &current.blocks)?
            .into_iter()
            .next()
            .ok_or(DirectoryError::InsufficientBlocks { requested: 1, available: 0 })?;
        let mut updated = current.clone();
        updated.blocks.push(replica.clone());
        let auto_scale = !state.status.flags.is_static_provisioned();

        let attached = async {
            let slot_range = storage.slot_range(&old_tail).await?;
            storage
                .setup_block(&replica, path, slot_range, &updated.blocks, auto_scale, ChainRole::Tail, None)
                .await?;
            let (interim, _) = current.wiring(current.len() - 1);
            storage
                .setup_block(&old_tail, path, slot_range, &updated.blocks, auto_scale, interim, Some(&replica))
                .await?;
            storage.forward_all(&old_tail).await?;
            let (role, next) = updated.wiring(current.len() - 1);
            storage
                .setup_block(&old_tail, path, slot_range, &updated.blocks, auto_scale, role, next)
                .await?;
            Ok::<_, DirectoryError>(())
        };
        if let Err(e) = attached.await {
            warn!(path, chain = %current, %replica, error = %e, "attaching replica failed; backing out");
            if let Err(e) = wiring::setup_chain(storage, path, &current, current.slot_range, auto_scale).await {
                warn!(path, chain = %current, error = %e, "restoring chain");
            }
            self.release(&[ReplicaChain::new(vec![replica], current.slot_range)]).await;
            return Err(e);
        }

        state.status.chains[index] = updated.clone();
        info!(path, chain = %updated, %replica, "replica added");
        Ok(updated)
    }
}
