//! A storage node: a fixed set of blocks behind one management surface.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use slotkv_client::ClientConfig;
use slotkv_protocol::{DirectoryService, ProtocolResult, StorageManagement, Transport};
use slotkv_types::{BlockId, ChainRole, SlotRange};

use crate::block::Block;
use crate::error::{StorageError, StorageResult};
use crate::kv::{HashTablePartition, KvConfig};
use crate::persistence::SnapshotStore;

/// Services shared by every block on a node.
pub struct NodeContext {
    pub transport: Arc<dyn Transport>,
    directory: RwLock<Option<Arc<dyn DirectoryService>>>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub kv: KvConfig,
    pub client: ClientConfig,
}

impl NodeContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        snapshots: Arc<dyn SnapshotStore>,
        kv: KvConfig,
        client: ClientConfig,
    ) -> Self {
        Self {
            transport,
            directory: RwLock::new(None),
            snapshots,
            kv,
            client,
        }
    }

    /// The directory blocks report overload to, once one is attached.
    pub fn directory(&self) -> Option<Arc<dyn DirectoryService>> {
        self.directory.read().expect("lock poisoned").clone()
    }

    /// Attach the directory. Nodes usually start before it is reachable.
    pub fn set_directory(&self, directory: Arc<dyn DirectoryService>) {
        *self.directory.write().expect("lock poisoned") = Some(directory);
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("kv", &self.kv)
            .field("client", &self.client)
            .field("has_directory", &self.directory().is_some())
            .finish()
    }
}

/// The network address of a node, shared by all its blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub service_port: u16,
    pub management_port: u16,
    pub notification_port: u16,
    pub chain_port: u16,
}

impl NodeAddress {
    pub fn block_id(&self, id: u32) -> BlockId {
        BlockId::new(
            self.host.clone(),
            self.service_port,
            self.management_port,
            self.notification_port,
            self.chain_port,
            id,
        )
    }
}

/// Hosts `num_blocks` hash-table blocks, numbered from zero.
#[derive(Debug)]
pub struct StorageNode {
    address: NodeAddress,
    blocks: Vec<Arc<Block>>,
    ctx: Arc<NodeContext>,
}

impl StorageNode {
    pub fn new(address: NodeAddress, num_blocks: u32, ctx: Arc<NodeContext>) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| {
                let partition = HashTablePartition::new(ctx.kv.clone());
                Block::new(address.block_id(i), Box::new(partition), Arc::clone(&ctx))
            })
            .collect();
        info!(node = %address.block_id(0).node_prefix(), num_blocks, "storage node created");
        Self { address, blocks, ctx }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id().clone()).collect()
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn block(&self, id: u32) -> StorageResult<&Arc<Block>> {
        self.blocks.get(id as usize).ok_or(StorageError::BlockNotFound(id))
    }

    /// Resolve a block id, checking that it actually names this node.
    pub fn lookup(&self, block: &BlockId) -> StorageResult<&Arc<Block>> {
        let found = self.block(block.id)?;
        if found.id() != block {
            return Err(StorageError::BlockNotFound(block.id));
        }
        Ok(found)
    }
}

#[async_trait]
impl StorageManagement for StorageNode {
    async fn setup_block(
        &self,
        block: &BlockId,
        path: &str,
        slot_range: SlotRange,
        chain: &[BlockId],
        auto_scale: bool,
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> ProtocolResult<()> {
        let b = self.lookup(block)?;
        b.setup(path, slot_range, chain.to_vec(), auto_scale, role, next).await?;
        Ok(())
    }

    async fn slot_range(&self, block: &BlockId) -> ProtocolResult<SlotRange> {
        Ok(self.lookup(block)?.slot_range())
    }

    async fn path(&self, block: &BlockId) -> ProtocolResult<String> {
        Ok(self.lookup(block)?.path())
    }

    async fn load(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.lookup(block)?.load(backing_path)?;
        Ok(())
    }

    async fn sync(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.lookup(block)?.sync(backing_path)?;
        Ok(())
    }

    async fn dump(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.lookup(block)?.dump(backing_path).await?;
        Ok(())
    }

    async fn reset(&self, block: &BlockId) -> ProtocolResult<()> {
        self.lookup(block)?.reset().await;
        Ok(())
    }

    async fn set_exporting(&self, block: &BlockId, target: &[BlockId], slot_range: SlotRange) -> ProtocolResult<()> {
        self.lookup(block)?.set_exporting(target.to_vec(), slot_range);
        Ok(())
    }

    async fn setup_and_set_importing(
        &self,
        block: &BlockId,
        path: &str,
        slot_range: SlotRange,
        chain: &[BlockId],
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> ProtocolResult<()> {
        let b = self.lookup(block)?;
        b.setup_and_set_importing(path, slot_range, chain.to_vec(), role, next).await?;
        Ok(())
    }

    async fn set_importing(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        self.lookup(block)?.set_importing(slot_range);
        Ok(())
    }

    async fn export_slots(&self, block: &BlockId) -> ProtocolResult<()> {
        self.lookup(block)?.export_slots().await?;
        Ok(())
    }

    async fn set_regular(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        self.lookup(block)?.set_regular(slot_range);
        Ok(())
    }

    async fn storage_capacity(&self, block: &BlockId) -> ProtocolResult<u64> {
        Ok(self.lookup(block)?.storage_capacity())
    }

    async fn storage_size(&self, block: &BlockId) -> ProtocolResult<u64> {
        Ok(self.lookup(block)?.storage_size())
    }

    async fn resend_pending(&self, block: &BlockId) -> ProtocolResult<()> {
        self.lookup(block)?.resend_pending().await?;
        Ok(())
    }

    async fn forward_all(&self, block: &BlockId) -> ProtocolResult<()> {
        self.lookup(block)?.forward_all().await?;
        Ok(())
    }

    async fn ping(&self, block: &BlockId) -> ProtocolResult<()> {
        self.lookup(block)?;
        Ok(())
    }
}
