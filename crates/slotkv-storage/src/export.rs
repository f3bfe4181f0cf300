use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use slotkv_client::{ClientError, LockedClient, ReplicaChainClient};
use slotkv_types::{reply, BlockState, OpTable, ReplicaChain};

use crate::block::Block;
use crate::error::{StorageError, StorageResult};

/// Operation ids the mover needs, looked up by name in the partition's table.
struct ExportOps {
    get_data: i32,
    put: i32,
    remove: i32,
}

impl ExportOps {
    fn resolve(ops: &OpTable) -> StorageResult<Self> {
        Ok(Self {
            get_data: ops.id_of("locked_get_data_in_slot_range")?,
            put: ops.id_of("locked_put")?,
            remove: ops.id_of("locked_remove")?,
        })
    }
}

impl Block {
    /// Move every key in the export range to the export target.
    ///
    /// Runs in batches: lock source and destination, copy one batch to the
    /// destination marked redirected, remove it from the source, unlock both.
    /// Clients only ever wait for one batch. Returns the number of keys moved.
    pub async fn export_slots(&self) -> StorageResult<usize> {
        let view = self.view();
        if view.state != BlockState::Exporting {
            return Err(StorageError::NotExporting(self.id.to_string()));
        }
        let result = self.export_batches().await;
        self.splitting.store(false, Ordering::SeqCst);
        self.merging.store(false, Ordering::SeqCst);
        result
    }

    async fn export_batches(&self) -> StorageResult<usize> {
        let view = self.view();
        let ops = ExportOps::resolve(self.partition.ops())?;
        let batch = self.ctx.kv.export_batch.max(1);
        let path = self.path();

        let client = |chain: ReplicaChain| {
            ReplicaChainClient::new(
                self.ctx.transport.clone(),
                None,
                path.clone(),
                chain,
                self.partition.ops().clone(),
                self.ctx.client.timeout,
            )
        };
        let source = client(ReplicaChain::new(self.chain(), view.slot_range));
        let destination = client(ReplicaChain::new(view.export_target.clone(), view.export_range));

        info!(block = %self.id, path = %path, export_range = %view.export_range, "export started");
        let mut src = LockedClient::lock(source).await?;
        let mut dst = match LockedClient::lock(destination).await {
            Ok(dst) => dst,
            Err(e) => {
                let _ = src.unlock().await;
                return Err(e.into());
            }
        };

        let mut moved = 0;
        loop {
            let step = self.export_one_batch(&mut src, &mut dst, &ops, batch).await;
            let unlocked = match (src.unlock().await, dst.unlock().await) {
                (Err(e), _) | (_, Err(e)) => Err(e),
                _ => Ok(()),
            };
            let n = step?;
            unlocked?;
            moved += n;
            if n < batch {
                break;
            }
            src.relock().await?;
            if let Err(e) = dst.relock().await {
                let _ = src.unlock().await;
                return Err(e.into());
            }
        }
        info!(block = %self.id, path = %path, moved, "export finished");
        Ok(moved)
    }

    /// Copy and delete one batch. Both chains must be locked.
    async fn export_one_batch(
        &self,
        src: &mut LockedClient,
        dst: &mut LockedClient,
        ops: &ExportOps,
        batch: usize,
    ) -> StorageResult<usize> {
        let range = self.view().export_range;
        let data = src
            .run_command(
                ops.get_data,
                vec![range.begin.to_string(), range.end.to_string(), batch.to_string()],
            )
            .await?;
        if data.first().map(String::as_str) == Some(reply::BLOCK_NOT_LOCKED) {
            return Err(ClientError::BlockNotLocked.into());
        }
        if data.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = data.iter().step_by(2).cloned().collect();
        debug!(block = %self.id, keys = keys.len(), "exporting batch");

        let written = dst.run_command_redirected(ops.put, data).await?;
        // A key already at the destination was copied by an earlier attempt.
        if let Some(bad) = written
            .iter()
            .find(|r| r.as_str() != reply::OK && r.as_str() != reply::DUPLICATE_KEY)
        {
            warn!(block = %self.id, reply = %bad, "destination refused exported keys");
            return Err(ClientError::UnexpectedReply(bad.clone()).into());
        }
        src.run_command(ops.remove, keys.clone()).await?;
        Ok(keys.len())
    }
}
