use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use slotkv_protocol::{CommandResponse, Notification, CHANNEL_CAPACITY};
use slotkv_types::{BlockId, BlockState, ChainRole, SequenceId, SlotRange};

use crate::chain::ChainLinks;
use crate::error::{StorageError, StorageResult};
use crate::node::NodeContext;
use crate::partition::{Partition, SlotView};
use crate::pending::PendingTable;
use crate::subscription::SubscriptionMap;

/// Directory-assigned identity of the data a block serves.
#[derive(Clone, Debug, Default)]
pub(crate) struct BlockMeta {
    pub path: String,
    pub chain: Vec<BlockId>,
    pub auto_scale: bool,
}

/// One storage block: a partition plus its chain-replication state.
///
/// Client-facing and chain-facing entry points live in `chain.rs`, the
/// migration mover in `export.rs`, and the load-driven split/merge triggers
/// in `scaling.rs`.
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) partition: Box<dyn Partition>,
    pub(crate) view: RwLock<Arc<SlotView>>,
    pub(crate) meta: RwLock<BlockMeta>,
    pub(crate) links: ChainLinks,
    pub(crate) pending: PendingTable,
    pub(crate) subscriptions: SubscriptionMap,
    pub(crate) clients: Mutex<HashMap<i64, mpsc::Sender<CommandResponse>>>,
    next_client_id: AtomicI64,
    /// Mirrors `partition.is_locked()` so waiters can park until unlock.
    pub(crate) lock_state: watch::Sender<bool>,
    pub(crate) dirty: AtomicBool,
    pub(crate) splitting: AtomicBool,
    pub(crate) merging: AtomicBool,
    pub(crate) ctx: Arc<NodeContext>,
    pub(crate) weak_self: Weak<Block>,
}

impl Block {
    pub fn new(id: BlockId, partition: Box<dyn Partition>, ctx: Arc<NodeContext>) -> Arc<Self> {
        let (lock_state, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            id,
            partition,
            view: RwLock::new(Arc::new(SlotView::default())),
            meta: RwLock::new(BlockMeta::default()),
            links: ChainLinks::new(),
            pending: PendingTable::new(),
            subscriptions: SubscriptionMap::new(),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicI64::new(0),
            lock_state,
            dirty: AtomicBool::new(false),
            splitting: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            ctx,
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn partition(&self) -> &dyn Partition {
        self.partition.as_ref()
    }

    pub fn view(&self) -> Arc<SlotView> {
        Arc::clone(&self.view.read().expect("lock poisoned"))
    }

    fn update_view(&self, f: impl FnOnce(&mut SlotView)) {
        let mut guard = self.view.write().expect("lock poisoned");
        let mut next = SlotView::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn role(&self) -> ChainRole {
        self.links.role()
    }

    pub fn state(&self) -> BlockState {
        self.view().state
    }

    pub fn slot_range(&self) -> SlotRange {
        self.view().slot_range
    }

    pub fn path(&self) -> String {
        self.meta.read().expect("lock poisoned").path.clone()
    }

    pub fn chain(&self) -> Vec<BlockId> {
        self.meta.read().expect("lock poisoned").chain.clone()
    }

    pub fn auto_scale(&self) -> bool {
        self.meta.read().expect("lock poisoned").auto_scale
    }

    pub fn storage_size(&self) -> u64 {
        self.partition.storage_size()
    }

    pub fn storage_capacity(&self) -> u64 {
        self.partition.storage_capacity()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // --- client registry ---

    /// Hand out a client id. Only meaningful at a chain head.
    pub fn get_client_id(&self) -> i64 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register `client_id` for responses from this block.
    pub fn register_client_id(&self, client_id: i64) -> mpsc::Receiver<CommandResponse> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.clients.lock().expect("lock poisoned").insert(client_id, tx);
        rx
    }

    pub fn subscribe(&self, ops: Vec<String>) -> mpsc::Receiver<Notification> {
        self.subscriptions.subscribe(ops)
    }

    pub(crate) async fn respond(&self, seq: SequenceId, result: Vec<String>) {
        let sender = self.clients.lock().expect("lock poisoned").get(&seq.client_id).cloned();
        match sender {
            Some(tx) => {
                if tx.send(CommandResponse { seq, result }).await.is_err() {
                    debug!(block = %self.id, client_id = seq.client_id, "client went away");
                    self.clients.lock().expect("lock poisoned").remove(&seq.client_id);
                }
            }
            None => debug!(block = %self.id, client_id = seq.client_id, "no client registered for response"),
        }
    }

    // --- local execution ---

    /// Park until the partition lock is released.
    pub(crate) async fn wait_unlocked(&self) {
        let mut rx = self.lock_state.subscribe();
        let _ = rx.wait_for(|locked| !*locked).await;
    }

    /// Run one command against the partition and record its side effects.
    pub(crate) fn apply(&self, op_id: i32, args: &[String]) -> StorageResult<Vec<String>> {
        let view = self.view();
        let result = self.partition.run_command(&view, op_id, args)?;
        if self.partition.ops().is_mutator(op_id) {
            self.dirty.store(true, Ordering::SeqCst);
        }
        self.lock_state.send_replace(self.partition.is_locked());
        Ok(result)
    }

    /// Execute directly on this block, outside the chain.
    pub async fn run_command(&self, op_id: i32, args: Vec<String>) -> StorageResult<Vec<String>> {
        if self.partition.ops().get(op_id).is_none() {
            return Err(StorageError::UnknownOp(op_id));
        }
        if !self.partition.bypasses_lock(op_id) {
            self.wait_unlocked().await;
        }
        self.apply(op_id, &args)
    }

    // --- management surface ---

    /// Assign the block to a file's chain at position `role`.
    #[allow(clippy::too_many_arguments)]
    pub async fn setup(
        &self,
        path: &str,
        slot_range: SlotRange,
        chain: Vec<BlockId>,
        auto_scale: bool,
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> StorageResult<()> {
        {
            let mut meta = self.meta.write().expect("lock poisoned");
            meta.path = path.to_string();
            meta.chain = chain;
            meta.auto_scale = auto_scale;
        }
        self.update_view(|v| v.slot_range = slot_range);
        self.links.set_role(role);
        debug!(block = %self.id, path, %slot_range, %role, "block setup");
        self.reset_next_and_listen(next).await
    }

    pub fn set_exporting(&self, target: Vec<BlockId>, slot_range: SlotRange) {
        info!(block = %self.id, %slot_range, target = %BlockId::join_chain(&target), "exporting");
        self.update_view(|v| {
            v.state = BlockState::Exporting;
            v.export_target = target;
            v.export_range = slot_range;
        });
    }

    pub fn set_importing(&self, slot_range: SlotRange) {
        info!(block = %self.id, %slot_range, "importing");
        self.update_view(|v| {
            v.state = BlockState::Importing;
            v.import_range = slot_range;
        });
    }

    /// Set up a fresh block that owns no slots yet and accepts `slot_range`
    /// from redirected traffic.
    pub async fn setup_and_set_importing(
        &self,
        path: &str,
        slot_range: SlotRange,
        chain: Vec<BlockId>,
        role: ChainRole,
        next: Option<&BlockId>,
    ) -> StorageResult<()> {
        self.setup(path, SlotRange::EMPTY, chain, true, role, next).await?;
        self.set_importing(slot_range);
        Ok(())
    }

    /// End a migration: own `slot_range` and nothing else.
    pub fn set_regular(&self, slot_range: SlotRange) {
        info!(block = %self.id, %slot_range, "regular");
        self.update_view(|v| {
            *v = SlotView::new(slot_range);
        });
        self.splitting.store(false, Ordering::SeqCst);
        self.merging.store(false, Ordering::SeqCst);
    }

    /// Return the block to its unassigned state.
    pub async fn reset(&self) {
        self.links.reset().await;
        self.partition.clear();
        self.pending.clear();
        self.subscriptions.clear();
        *self.meta.write().expect("lock poisoned") = BlockMeta::default();
        *self.view.write().expect("lock poisoned") = Arc::new(SlotView::default());
        self.dirty.store(false, Ordering::SeqCst);
        self.splitting.store(false, Ordering::SeqCst);
        self.merging.store(false, Ordering::SeqCst);
        self.lock_state.send_replace(false);
        debug!(block = %self.id, "block reset");
    }

    // --- persistence ---

    /// Write the partition to `backing_path` if it changed since the last flush.
    pub fn sync(&self, backing_path: &str) -> StorageResult<()> {
        self.flush(backing_path, false)
    }

    /// Write the partition to `backing_path` unconditionally, then clear the block.
    pub async fn dump(&self, backing_path: &str) -> StorageResult<()> {
        self.flush(backing_path, true)?;
        self.reset().await;
        Ok(())
    }

    fn flush(&self, backing_path: &str, force: bool) -> StorageResult<()> {
        if self.dirty.swap(false, Ordering::SeqCst) || force {
            let bytes = self.partition.snapshot()?;
            if let Err(e) = self.ctx.snapshots.save(backing_path, &bytes) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
            info!(block = %self.id, backing_path, bytes = bytes.len(), "flushed");
        }
        Ok(())
    }

    /// Replace the partition contents with the snapshot at `backing_path`.
    pub fn load(&self, backing_path: &str) -> StorageResult<()> {
        let bytes = self
            .ctx
            .snapshots
            .load(backing_path)?
            .ok_or_else(|| StorageError::SnapshotNotFound(backing_path.to_string()))?;
        self.partition.restore(&bytes)?;
        self.dirty.store(false, Ordering::SeqCst);
        info!(block = %self.id, backing_path, "loaded");
        Ok(())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id.to_string())
            .field("role", &self.role())
            .field("view", &self.view())
            .field("pending", &self.pending.len())
            .finish()
    }
}
