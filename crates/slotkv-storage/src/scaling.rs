use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use slotkv_types::SLOT_MAX;

use crate::block::Block;

/// Which re-partitioning a block asks the directory for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScaleRequest {
    Split,
    Merge,
}

impl Block {
    /// Decide whether the mutator just applied at the tail should trigger a
    /// split or merge of this block's range.
    pub(crate) fn scale_decision(&self, op_id: i32) -> Option<ScaleRequest> {
        if !self.auto_scale() || !self.partition.ops().is_mutator(op_id) {
            return None;
        }
        let view = self.view();
        if view.is_migrating() || self.partition.is_locked() {
            return None;
        }
        if self.partition.overloaded() {
            return Some(ScaleRequest::Split);
        }
        if self.partition.shrinks(op_id) && self.partition.underloaded() && view.slot_range.end != SLOT_MAX {
            return Some(ScaleRequest::Merge);
        }
        None
    }

    /// Ask the directory to split or merge this block's range in the
    /// background. At most one request of each kind is in flight per block.
    pub(crate) fn maybe_autoscale(&self, op_id: i32) {
        let Some(request) = self.scale_decision(op_id) else {
            return;
        };
        let flag: &AtomicBool = match request {
            ScaleRequest::Split => &self.splitting,
            ScaleRequest::Merge => &self.merging,
        };
        if flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let (Some(block), Some(directory)) = (self.weak_self.upgrade(), self.ctx.directory()) else {
            warn!(block = %self.id, ?request, "no directory to re-partition with");
            flag.store(false, Ordering::SeqCst);
            return;
        };
        let path = self.path();
        let range = self.slot_range();
        info!(block = %self.id, path = %path, %range, size = self.storage_size(), ?request, "requesting re-partition");
        tokio::spawn(async move {
            let (result, flag) = match request {
                ScaleRequest::Split => (directory.split_slot_range(&path, range).await, &block.splitting),
                ScaleRequest::Merge => (directory.merge_slot_range(&path, range).await, &block.merging),
            };
            if let Err(e) = result {
                warn!(block = %block.id, path = %path, %range, ?request, error = %e, "re-partition failed");
            }
            flag.store(false, Ordering::SeqCst);
        });
    }
}
