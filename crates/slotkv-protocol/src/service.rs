//! Service traits for the calls that cross process boundaries.
//!
//! Components hold these as `Arc<dyn Trait>` and never see whether the peer
//! is across a socket or in the same process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use slotkv_types::{BlockId, ChainRole, DataStatus, ReplicaChain, SequenceId, SlotRange};

use crate::error::ProtocolResult;
use crate::message::{CommandResponse, Notification};

/// Capacity of response, notification, and acknowledgment channels.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Opens connections to storage blocks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Client-facing connection to a block's service endpoint.
    async fn connect(&self, block: &BlockId) -> ProtocolResult<Arc<dyn BlockConnection>>;

    /// Downstream chain link to `block`. The target registers the returned
    /// acknowledgment channel as its upstream ack sink.
    async fn connect_chain(&self, block: &BlockId) -> ProtocolResult<ChainConnection>;
}

/// A downstream chain link plus the acknowledgments flowing back over it.
pub struct ChainConnection {
    pub link: Arc<dyn ChainLink>,
    pub acks: mpsc::Receiver<SequenceId>,
}

/// Forwarding half of a chain link.
#[async_trait]
pub trait ChainLink: Send + Sync {
    async fn chain_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()>;
}

/// Client connection to one block.
#[async_trait]
pub trait BlockConnection: Send + Sync {
    /// Ask a chain head for a fresh client id.
    async fn get_client_id(&self) -> ProtocolResult<i64>;

    /// Register `client_id` with a tail; its responses arrive on the returned channel.
    async fn register_client_id(&self, client_id: i64) -> ProtocolResult<mpsc::Receiver<CommandResponse>>;

    /// Submit a request. The response arrives asynchronously from the tail.
    async fn command_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()>;

    /// Execute an operation on this block only, bypassing the chain.
    async fn run_command(&self, op_id: i32, args: Vec<String>) -> ProtocolResult<Vec<String>>;

    /// Receive notifications for the named operations.
    async fn subscribe(&self, ops: Vec<String>) -> ProtocolResult<mpsc::Receiver<Notification>>;
}

/// Directory-to-block management surface.
#[async_trait]
pub trait StorageManagement: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn setup_block(
        &self,
        block: &BlockId,
        path: &str,
        slot_range: SlotRange,
        chain: &[BlockId],
        auto_scale: bool,
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> ProtocolResult<()>;

    async fn slot_range(&self, block: &BlockId) -> ProtocolResult<SlotRange>;

    async fn path(&self, block: &BlockId) -> ProtocolResult<String>;

    async fn load(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()>;

    async fn sync(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()>;

    async fn dump(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()>;

    async fn reset(&self, block: &BlockId) -> ProtocolResult<()>;

    async fn set_exporting(&self, block: &BlockId, target: &[BlockId], slot_range: SlotRange) -> ProtocolResult<()>;

    async fn setup_and_set_importing(
        &self,
        block: &BlockId,
        path: &str,
        slot_range: SlotRange,
        chain: &[BlockId],
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> ProtocolResult<()>;

    async fn set_importing(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()>;

    /// Move every key in the block's export range to its export target.
    /// Returns once the migration has finished.
    async fn export_slots(&self, block: &BlockId) -> ProtocolResult<()>;

    async fn set_regular(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()>;

    async fn storage_capacity(&self, block: &BlockId) -> ProtocolResult<u64>;

    async fn storage_size(&self, block: &BlockId) -> ProtocolResult<u64>;

    async fn resend_pending(&self, block: &BlockId) -> ProtocolResult<()>;

    async fn forward_all(&self, block: &BlockId) -> ProtocolResult<()>;

    /// Liveness probe of the node hosting `block`.
    async fn ping(&self, block: &BlockId) -> ProtocolResult<()>;
}

/// Calls served by the directory.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus>;

    async fn open(&self, path: &str) -> ProtocolResult<DataStatus>;

    async fn open_or_create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus>;

    async fn exists(&self, path: &str) -> ProtocolResult<bool>;

    async fn remove(&self, path: &str) -> ProtocolResult<()>;

    async fn dstatus(&self, path: &str) -> ProtocolResult<DataStatus>;

    async fn add_block_to_file(&self, path: &str) -> ProtocolResult<()>;

    async fn split_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()>;

    async fn merge_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()>;

    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain>;

    async fn add_replica_to_chain(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain>;

    async fn handle_lease_expiry(&self, path: &str) -> ProtocolResult<()>;

    async fn dump(&self, path: &str, backing_path: &str) -> ProtocolResult<()>;

    async fn load(&self, path: &str, backing_path: &str) -> ProtocolResult<()>;

    async fn sync(&self, path: &str, backing_path: &str) -> ProtocolResult<()>;
}
