//! Live re-partitioning: split, merge, and add-block.
//!
//! Every workflow has three steps:
//!
//! 1. **Prepare** (file locked): pick the chains, wire the destination, and
//!    mark the source exporting and the destination importing.
//! 2. **Export** (file unlocked): the source moves its keys in locked batches.
//!    Clients keep working, following `exporting` redirects.
//! 3. **Commit** (file locked): return every block to `regular`, then update
//!    the layout. The layout changes only after the blocks have.
//!
//! An export that keeps failing aborts the workflow: keys already moved are
//! sent back where possible, both chains return to `regular` over their
//! original ranges, and a split's new chain is released. The same split or
//! merge can then be requested again.

use std::time::Instant;

use tracing::{error, info, warn};

use slotkv_types::{ChainStatus, DataStatus, ReplicaChain, SlotRange, SLOT_MAX};

use crate::error::{DirectoryError, DirectoryResult};
use crate::tree::{DirectoryTree, FileNode, FileState};
use crate::wiring;

/// Attempts at `export_slots` before a migration is abandoned.
const EXPORT_ATTEMPTS: usize = 3;

/// Data flows from `from` to `to`.
#[derive(Clone, Debug)]
struct ExportPlan {
    from: ReplicaChain,
    to: ReplicaChain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Migration {
    Split,
    Merge,
}

fn chain_index(status: &DataStatus, path: &str, range: SlotRange) -> DirectoryResult<usize> {
    status.find_range(range).ok_or_else(|| DirectoryError::NoSuchRange {
        path: path.to_string(),
        range,
    })
}

impl DirectoryTree {
    /// Split the chain the policy picks (by default the largest) in two.
    pub async fn add_block_to_file(&self, path: &str) -> DirectoryResult<()> {
        let node = self.file(path)?;
        let plan = {
            let mut state = node.write().await;
            let mut sizes = Vec::with_capacity(state.status.chains.len());
            for chain in &state.status.chains {
                let size = match chain.tail() {
                    Some(tail) => self.storage.storage_size(tail).await?,
                    None => 0,
                };
                sizes.push(size);
            }
            let index = self
                .policy
                .split_candidate(&state.status, &sizes)
                .ok_or_else(|| DirectoryError::CapacityExhausted {
                    path: path.to_string(),
                    max: state.status.chains.len(),
                })?;
            self.prepare_split(path, &mut state, index).await?
        };
        if let Err(e) = self.export(path, &plan).await {
            return Err(self.abort(&node, path, &plan, Migration::Split, e).await);
        }
        self.commit_split(&node, path, &plan).await
    }

    /// Split the chain owning exactly `slot_range` at its midpoint. The upper
    /// half moves to a newly allocated chain.
    pub async fn split_slot_range(&self, path: &str, slot_range: SlotRange) -> DirectoryResult<()> {
        info!(path, %slot_range, "splitting slot range");
        let node = self.file(path)?;
        let plan = {
            let mut state = node.write().await;
            let index = chain_index(&state.status, path, slot_range)?;
            self.prepare_split(path, &mut state, index).await?
        };
        if let Err(e) = self.export(path, &plan).await {
            return Err(self.abort(&node, path, &plan, Migration::Split, e).await);
        }
        self.commit_split(&node, path, &plan).await
    }

    /// Merge the chain owning exactly `slot_range` into its neighbour and
    /// free its blocks.
    pub async fn merge_slot_range(&self, path: &str, slot_range: SlotRange) -> DirectoryResult<()> {
        info!(path, %slot_range, "merging slot range");
        let node = self.file(path)?;
        let plan = {
            let mut state = node.write().await;
            self.prepare_merge(path, &mut state, slot_range).await?
        };
        if let Err(e) = self.export(path, &plan).await {
            return Err(self.abort(&node, path, &plan, Migration::Merge, e).await);
        }
        self.commit_merge(&node, path, &plan).await
    }

    async fn prepare_split(&self, path: &str, state: &mut FileState, index: usize) -> DirectoryResult<ExportPlan> {
        let storage = self.storage.as_ref();
        if state.status.chains.len() + state.adding.len() >= SLOT_MAX as usize {
            return Err(DirectoryError::CapacityExhausted {
                path: path.to_string(),
                max: SLOT_MAX as usize,
            });
        }
        let from = state.status.chains[index].clone();
        if from.is_migrating() {
            return Err(DirectoryError::AlreadyMigrating {
                path: path.to_string(),
                range: from.slot_range,
            });
        }
        if from.slot_range.len() < 2 {
            return Err(DirectoryError::InvalidArgument(format!(
                "slot range {} has a single slot",
                from.slot_range
            )));
        }

        let (_, upper) = from.slot_range.split();
        let blocks = self.allocator.allocate(state.status.chain_length, &[])?;
        let to = ReplicaChain::new(blocks, upper);
        let wired = async {
            wiring::setup_importing_chain(storage, path, &to, upper).await?;
            wiring::set_exporting(storage, &from, &to, upper).await
        };
        if let Err(e) = wired.await {
            warn!(path, from = %from, error = %e, "split setup failed; backing out");
            if let Err(e) = wiring::set_regular(storage, &from, from.slot_range).await {
                warn!(path, from = %from, error = %e, "restoring source chain");
            }
            self.release(std::slice::from_ref(&to)).await;
            return Err(e);
        }

        state.status.chains[index].status = ChainStatus::Exporting;
        state.adding.push(to.clone());
        info!(path, from = %from, to = %to, "split prepared");
        Ok(ExportPlan { from, to })
    }

    async fn commit_split(&self, node: &FileNode, path: &str, plan: &ExportPlan) -> DirectoryResult<()> {
        let storage = self.storage.as_ref();
        let mut state = node.write().await;
        let index = chain_index(&state.status, path, plan.from.slot_range)?;
        // The source may have been repaired while the export ran.
        let from = state.status.chains[index].clone();
        let (lower, upper) = plan.from.slot_range.split();
        wiring::set_regular(storage, &from, lower).await?;
        wiring::set_regular(storage, &plan.to, upper).await?;

        state.status.chains[index].slot_range = lower;
        state.status.chains[index].status = ChainStatus::Stable;
        let mut to = plan.to.clone();
        to.status = ChainStatus::Stable;
        state.adding.retain(|c| c != &plan.to);
        state.status.chains.insert(index + 1, to);
        info!(path, chains = state.status.chains.len(), %lower, %upper, "split committed");
        Ok(())
    }

    async fn prepare_merge(&self, path: &str, state: &mut FileState, slot_range: SlotRange) -> DirectoryResult<ExportPlan> {
        let storage = self.storage.as_ref();
        let no_partner = || DirectoryError::NoMergePartner {
            path: path.to_string(),
            range: slot_range,
        };
        if state.status.chains.len() < 2 || slot_range.end == SLOT_MAX {
            return Err(no_partner());
        }
        let index = chain_index(&state.status, path, slot_range)?;
        let from = state.status.chains[index].clone();
        if from.is_migrating() {
            return Err(DirectoryError::AlreadyMigrating {
                path: path.to_string(),
                range: slot_range,
            });
        }
        let partner = self.policy.merge_partner(&state.status, index).ok_or_else(no_partner)?;
        let to = state.status.chains[partner].clone();
        if to.is_migrating() {
            return Err(no_partner());
        }

        let wired = async {
            wiring::set_importing(storage, &to, slot_range).await?;
            wiring::set_exporting(storage, &from, &to, slot_range).await
        };
        if let Err(e) = wired.await {
            warn!(path, from = %from, to = %to, error = %e, "merge setup failed; backing out");
            for chain in [&from, &to] {
                if let Err(e) = wiring::set_regular(storage, chain, chain.slot_range).await {
                    warn!(path, chain = %chain, error = %e, "restoring chain");
                }
            }
            return Err(e);
        }

        state.status.chains[index].status = ChainStatus::Exporting;
        state.status.chains[partner].status = ChainStatus::Importing;
        info!(path, from = %from, to = %to, "merge prepared");
        Ok(ExportPlan { from, to })
    }

    async fn commit_merge(&self, node: &FileNode, path: &str, plan: &ExportPlan) -> DirectoryResult<()> {
        let storage = self.storage.as_ref();
        let mut state = node.write().await;
        let from_index = chain_index(&state.status, path, plan.from.slot_range)?;
        let to_index = chain_index(&state.status, path, plan.to.slot_range)?;
        let from = state.status.chains[from_index].clone();
        let to = state.status.chains[to_index].clone();
        let merged = SlotRange {
            begin: from.slot_range.begin.min(to.slot_range.begin),
            end: from.slot_range.end.max(to.slot_range.end),
        };
        wiring::set_regular(storage, &to, merged).await?;
        wiring::reset(storage, &from).await?;

        state.status.chains[to_index].slot_range = merged;
        state.status.chains[to_index].status = ChainStatus::Stable;
        state.status.chains.remove(from_index);
        if let Err(e) = self.allocator.free(&from.blocks) {
            warn!(path, chain = %from, error = %e, "freeing merged blocks");
        }
        info!(path, chains = state.status.chains.len(), %merged, "merge committed");
        Ok(())
    }

    async fn export(&self, path: &str, plan: &ExportPlan) -> DirectoryResult<()> {
        let head = plan.from.head().ok_or_else(|| DirectoryError::NoSuchChain {
            path: path.to_string(),
            chain: plan.from.to_string(),
        })?;
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            match self.storage.export_slots(head).await {
                Ok(()) => {
                    info!(
                        path,
                        from = %plan.from,
                        to = %plan.to,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "export finished"
                    );
                    return Ok(());
                }
                Err(e) if attempt < EXPORT_ATTEMPTS => {
                    warn!(path, from = %plan.from, attempt, error = %e, "export failed; retrying");
                    attempt += 1;
                }
                Err(e) => {
                    error!(path, from = %plan.from, to = %plan.to, error = %e, "export abandoned");
                    return Err(e.into());
                }
            }
        }
    }

    /// Undo a prepared migration whose export was abandoned and hand back
    /// `cause`.
    async fn abort(
        &self,
        node: &FileNode,
        path: &str,
        plan: &ExportPlan,
        kind: Migration,
        cause: DirectoryError,
    ) -> DirectoryError {
        let storage = self.storage.as_ref();
        let moved = match kind {
            Migration::Split => plan.to.slot_range,
            Migration::Merge => plan.from.slot_range,
        };
        if let Err(e) = self.export_back(path, plan, moved).await {
            warn!(path, from = %plan.to, to = %plan.from, error = %e, "returning exported keys");
        }

        let mut state = node.write().await;
        let from = match state.status.find_range(plan.from.slot_range) {
            Some(index) => {
                state.status.chains[index].status = ChainStatus::Stable;
                state.status.chains[index].clone()
            }
            None => plan.from.clone(),
        };
        if let Err(e) = wiring::set_regular(storage, &from, from.slot_range).await {
            warn!(path, chain = %from, error = %e, "restoring source chain");
        }
        match kind {
            Migration::Split => {
                state.adding.retain(|c| c != &plan.to);
                self.release(std::slice::from_ref(&plan.to)).await;
            }
            Migration::Merge => {
                let to = match state.status.find_range(plan.to.slot_range) {
                    Some(index) => {
                        state.status.chains[index].status = ChainStatus::Stable;
                        state.status.chains[index].clone()
                    }
                    None => plan.to.clone(),
                };
                if let Err(e) = wiring::set_regular(storage, &to, to.slot_range).await {
                    warn!(path, chain = %to, error = %e, "restoring destination chain");
                }
            }
        }
        warn!(path, from = %plan.from, to = %plan.to, ?kind, error = %cause, "migration aborted");
        cause
    }

    /// Reverse the direction of `plan` over `moved` and run one export, so
    /// keys that already reached the destination return to the source.
    async fn export_back(&self, path: &str, plan: &ExportPlan, moved: SlotRange) -> DirectoryResult<()> {
        let storage = self.storage.as_ref();
        let head = plan.to.head().ok_or_else(|| DirectoryError::NoSuchChain {
            path: path.to_string(),
            chain: plan.to.to_string(),
        })?;
        wiring::set_importing(storage, &plan.from, moved).await?;
        wiring::set_exporting(storage, &plan.to, &plan.from, moved).await?;
        self.storage.export_slots(head).await?;
        Ok(())
    }
}
