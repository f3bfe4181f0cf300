//! In-process cluster.
//!
//! [`LocalNetwork`] hosts any number of storage nodes in one process and
//! connects them through the same service traits the TCP stack implements.
//! Nodes can be killed and revived to exercise failure handling: a dead node
//! refuses every call with [`ProtocolError::ConnectionClosed`] while keeping
//! its memory, like a partitioned process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use slotkv_client::ClientConfig;
use slotkv_protocol::{
    BlockConnection, ChainConnection, ChainLink, CommandResponse, DirectoryService, Notification,
    ProtocolError, ProtocolResult, StorageManagement, Transport, CHANNEL_CAPACITY,
};
use slotkv_types::{BlockId, ChainRole, SequenceId, SlotRange};

use crate::block::Block;
use crate::kv::KvConfig;
use crate::node::{NodeAddress, NodeContext, StorageNode};
use crate::persistence::SnapshotStore;

#[derive(Clone)]
struct LocalNode {
    node: Arc<StorageNode>,
    alive: Arc<AtomicBool>,
}

impl LocalNode {
    fn check_alive(&self) -> ProtocolResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }
}

/// Storage nodes wired together in memory.
pub struct LocalNetwork {
    nodes: RwLock<BTreeMap<String, LocalNode>>,
    directory: RwLock<Option<Arc<dyn DirectoryService>>>,
    snapshots: Arc<dyn SnapshotStore>,
    client: ClientConfig,
    weak_self: Weak<LocalNetwork>,
}

impl LocalNetwork {
    pub fn new(snapshots: Arc<dyn SnapshotStore>, client: ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            nodes: RwLock::new(BTreeMap::new()),
            directory: RwLock::new(None),
            snapshots,
            client,
            weak_self: weak_self.clone(),
        })
    }

    /// Handle for clients and blocks to open connections with.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LocalHandle(self.weak_self.clone()))
    }

    /// Handle for the directory to manage blocks with.
    pub fn management(&self) -> Arc<dyn StorageManagement> {
        Arc::new(LocalHandle(self.weak_self.clone()))
    }

    /// Start a node with `num_blocks` blocks. Nodes are named `node0`,
    /// `node1`, ... in creation order.
    pub fn add_node(&self, num_blocks: u32, kv: KvConfig) -> Arc<StorageNode> {
        let mut nodes = self.nodes.write().expect("lock poisoned");
        let address = NodeAddress {
            host: format!("node{}", nodes.len()),
            service_port: 9090,
            management_port: 9091,
            notification_port: 9092,
            chain_port: 9093,
        };
        let ctx = Arc::new(NodeContext::new(self.transport(), Arc::clone(&self.snapshots), kv, self.client.clone()));
        if let Some(directory) = self.directory() {
            ctx.set_directory(directory);
        }
        let node = Arc::new(StorageNode::new(address, num_blocks, ctx));
        let prefix = node.address().block_id(0).node_prefix();
        nodes.insert(
            prefix,
            LocalNode {
                node: Arc::clone(&node),
                alive: Arc::new(AtomicBool::new(true)),
            },
        );
        node
    }

    pub fn directory(&self) -> Option<Arc<dyn DirectoryService>> {
        self.directory.read().expect("lock poisoned").clone()
    }

    /// Attach the directory to every node, present and future.
    pub fn set_directory(&self, directory: Arc<dyn DirectoryService>) {
        for local in self.nodes.read().expect("lock poisoned").values() {
            local.node.context().set_directory(Arc::clone(&directory));
        }
        *self.directory.write().expect("lock poisoned") = Some(directory);
    }

    /// Every block of every node, in node order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.nodes
            .read()
            .expect("lock poisoned")
            .values()
            .flat_map(|l| l.node.block_ids())
            .collect()
    }

    /// Direct access to a block, dead or alive.
    pub fn block(&self, id: &BlockId) -> Option<Arc<Block>> {
        let local = self.local(id).ok()?;
        local.node.lookup(id).ok().cloned()
    }

    /// Take down the node hosting `block`. Returns `false` for unknown nodes.
    pub fn kill(&self, block: &BlockId) -> bool {
        self.set_alive(block, false)
    }

    pub fn revive(&self, block: &BlockId) -> bool {
        self.set_alive(block, true)
    }

    fn set_alive(&self, block: &BlockId, alive: bool) -> bool {
        match self.local(block) {
            Ok(local) => {
                local.alive.store(alive, Ordering::SeqCst);
                info!(node = %block.node_prefix(), alive, "node liveness changed");
                true
            }
            Err(_) => false,
        }
    }

    fn local(&self, block: &BlockId) -> ProtocolResult<LocalNode> {
        self.nodes
            .read()
            .expect("lock poisoned")
            .get(&block.node_prefix())
            .cloned()
            .ok_or_else(|| ProtocolError::BlockNotFound(block.to_string()))
    }

    fn live_node(&self, block: &BlockId) -> ProtocolResult<Arc<StorageNode>> {
        let local = self.local(block)?;
        local.check_alive()?;
        Ok(local.node)
    }

    fn live_block(&self, block: &BlockId) -> ProtocolResult<(Arc<Block>, Arc<AtomicBool>)> {
        let local = self.local(block)?;
        local.check_alive()?;
        let found = local.node.lookup(block)?;
        Ok((Arc::clone(found), local.alive))
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes: Vec<String> = self.nodes.read().expect("lock poisoned").keys().cloned().collect();
        f.debug_struct("LocalNetwork").field("nodes", &nodes).finish()
    }
}

/// Weak handle onto the network, so nodes and the directory can hold it
/// without keeping the network alive.
struct LocalHandle(Weak<LocalNetwork>);

impl LocalHandle {
    fn network(&self) -> ProtocolResult<Arc<LocalNetwork>> {
        self.0.upgrade().ok_or(ProtocolError::ConnectionClosed)
    }

    fn node(&self, block: &BlockId) -> ProtocolResult<Arc<StorageNode>> {
        self.network()?.live_node(block)
    }
}

#[async_trait]
impl Transport for LocalHandle {
    async fn connect(&self, block: &BlockId) -> ProtocolResult<Arc<dyn BlockConnection>> {
        let (block, alive) = self.network()?.live_block(block)?;
        Ok(Arc::new(LocalConnection { block, alive }))
    }

    async fn connect_chain(&self, block: &BlockId) -> ProtocolResult<ChainConnection> {
        let (target, alive) = self.network()?.live_block(block)?;
        let (tx, acks) = mpsc::channel(CHANNEL_CAPACITY);
        target.attach_prev(tx);
        Ok(ChainConnection {
            link: Arc::new(LocalChainLink { target, alive }),
            acks,
        })
    }
}

struct LocalConnection {
    block: Arc<Block>,
    alive: Arc<AtomicBool>,
}

impl LocalConnection {
    fn check_alive(&self) -> ProtocolResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl BlockConnection for LocalConnection {
    async fn get_client_id(&self) -> ProtocolResult<i64> {
        self.check_alive()?;
        Ok(self.block.get_client_id())
    }

    async fn register_client_id(&self, client_id: i64) -> ProtocolResult<mpsc::Receiver<CommandResponse>> {
        self.check_alive()?;
        Ok(self.block.register_client_id(client_id))
    }

    async fn command_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()> {
        self.check_alive()?;
        self.block.request(seq, op_id, args).await?;
        Ok(())
    }

    async fn run_command(&self, op_id: i32, args: Vec<String>) -> ProtocolResult<Vec<String>> {
        self.check_alive()?;
        Ok(self.block.run_command(op_id, args).await?)
    }

    async fn subscribe(&self, ops: Vec<String>) -> ProtocolResult<mpsc::Receiver<Notification>> {
        self.check_alive()?;
        Ok(self.block.subscribe(ops))
    }
}

struct LocalChainLink {
    target: Arc<Block>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ChainLink for LocalChainLink {
    async fn chain_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.target.chain_request(seq, op_id, args).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageManagement for LocalHandle {
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
        self.node(block)?
            .setup_block(block, path, slot_range, chain, auto_scale, role, next)
            .await
    }

    async fn slot_range(&self, block: &BlockId) -> ProtocolResult<SlotRange> {
        self.node(block)?.slot_range(block).await
    }

    async fn path(&self, block: &BlockId) -> ProtocolResult<String> {
        self.node(block)?.path(block).await
    }

    async fn load(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.node(block)?.load(block, backing_path).await
    }

    async fn sync(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.node(block)?.sync(block, backing_path).await
    }

    async fn dump(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        self.node(block)?.dump(block, backing_path).await
    }

    async fn reset(&self, block: &BlockId) -> ProtocolResult<()> {
        self.node(block)?.reset(block).await
    }

    async fn set_exporting(&self, block: &BlockId, target: &[BlockId], slot_range: SlotRange) -> ProtocolResult<()> {
        self.node(block)?.set_exporting(block, target, slot_range).await
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
        self.node(block)?
            .setup_and_set_importing(block, path, slot_range, chain, role, next)
            .await
    }

    async fn set_importing(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        self.node(block)?.set_importing(block, slot_range).await
    }

    async fn export_slots(&self, block: &BlockId) -> ProtocolResult<()> {
        self.node(block)?.export_slots(block).await
    }

    async fn set_regular(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        self.node(block)?.set_regular(block, slot_range).await
    }

    async fn storage_capacity(&self, block: &BlockId) -> ProtocolResult<u64> {
        self.node(block)?.storage_capacity(block).await
    }

    async fn storage_size(&self, block: &BlockId) -> ProtocolResult<u64> {
        self.node(block)?.storage_size(block).await
    }

    async fn resend_pending(&self, block: &BlockId) -> ProtocolResult<()> {
        self.node(block)?.resend_pending(block).await
    }

    async fn forward_all(&self, block: &BlockId) -> ProtocolResult<()> {
        self.node(block)?.forward_all(block).await
    }

    async fn ping(&self, block: &BlockId) -> ProtocolResult<()> {
        self.node(block)?.ping(block).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use slotkv_client::{LockedClient, ReplicaChainClient};
    use slotkv_types::{kv, kv_ops, reply, ReplicaChain};

    use super::*;
    use crate::persistence::InMemorySnapshotStore;

    fn network() -> Arc<LocalNetwork> {
        let config = ClientConfig {
            timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        LocalNetwork::new(Arc::new(InMemorySnapshotStore::new()), config)
    }

    /// Wire `blocks` into one chain over `range` the way the directory would.
    async fn wire(net: &LocalNetwork, blocks: &[BlockId], range: SlotRange) {
        let mgmt = net.management();
        let chain = ReplicaChain::new(blocks.to_vec(), range);
        for (i, block) in blocks.iter().enumerate() {
            let (role, next) = chain.wiring(i);
            mgmt.setup_block(block, "/f", range, blocks, false, role, next)
                .await
                .unwrap();
        }
    }

    fn client(net: &LocalNetwork, blocks: &[BlockId], range: SlotRange) -> ReplicaChainClient {
        ReplicaChainClient::new(
            net.transport(),
            None,
            "/f".to_string(),
            ReplicaChain::new(blocks.to_vec(), range),
            kv_ops(),
            Duration::from_secs(2),
        )
    }

    fn three_nodes(net: &LocalNetwork) -> Vec<BlockId> {
        (0..3).map(|_| net.add_node(1, KvConfig::default()).block_ids()[0].clone()).collect()
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn replicas_apply_mutators_in_order() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids, SlotRange::full()).await;
        let mut c = client(&net, &ids, SlotRange::full());

        for i in 0..50 {
            let r = c.run_command(kv::PUT, args(&["k", &i.to_string()])).await.unwrap();
            let expected = if i == 0 { reply::OK } else { reply::DUPLICATE_KEY };
            assert_eq!(r, vec![expected.to_string()]);
            c.run_command(kv::UPDATE, args(&["k", &i.to_string()])).await.unwrap();
        }
        for id in &ids {
            let block = net.block(id).unwrap();
            let v = block.run_command(kv::GET, args(&["k"])).await.unwrap();
            assert_eq!(v, vec!["49".to_string()]);
        }
    }

    #[tokio::test]
    async fn acks_drain_pending_tables() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids, SlotRange::full()).await;
        let mut c = client(&net, &ids, SlotRange::full());

        for i in 0..20 {
            c.run_command(kv::PUT, vec![format!("key{i}"), "v".to_string()]).await.unwrap();
        }
        // Acks travel over background listeners.
        for _ in 0..100 {
            if ids.iter().all(|id| net.block(id).unwrap().pending_len() == 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for id in &ids {
            assert_eq!(net.block(id).unwrap().pending_len(), 0, "pending left on {id}");
        }
    }

    #[tokio::test]
    async fn accessor_at_head_is_refused() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids, SlotRange::full()).await;
        let head = net.block(&ids[0]).unwrap();
        let err = head
            .request(SequenceId::new(0, 0), kv::GET, args(&["k"]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::StorageError::ChainViolation { .. }));

        let mid = net.block(&ids[1]).unwrap();
        assert!(mid.request(SequenceId::new(0, 0), kv::PUT, args(&["k", "v"])).await.is_err());
        assert!(head.chain_request(SequenceId::new(0, 0), kv::PUT, args(&["k", "v"])).await.is_err());
    }

    #[tokio::test]
    async fn resend_pending_after_successor_replaced() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids, SlotRange::full()).await;
        let mut c = client(&net, &ids, SlotRange::full());
        c.run_command(kv::PUT, args(&["a", "1"])).await.unwrap();

        net.kill(&ids[1]);
        assert!(c.run_command(kv::PUT, args(&["b", "2"])).await.is_err());
        let head = net.block(&ids[0]).unwrap();
        // Applied at the head, never acknowledged.
        assert!(head.pending_len() >= 1);

        // Rewire around the dead mid and replay.
        let survivors = vec![ids[0].clone(), ids[2].clone()];
        wire(&net, &survivors, SlotRange::full()).await;
        net.management().resend_pending(&ids[0]).await.unwrap();

        let tail = net.block(&ids[2]).unwrap();
        assert_eq!(tail.run_command(kv::GET, args(&["b"])).await.unwrap(), vec!["2".to_string()]);
        for _ in 0..100 {
            if head.pending_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(head.pending_len(), 0);
    }

    #[tokio::test]
    async fn forward_all_fills_a_new_tail() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids[..2], SlotRange::full()).await;
        let mut c = client(&net, &ids[..2], SlotRange::full());
        for i in 0..10 {
            c.run_command(kv::PUT, vec![format!("k{i}"), i.to_string()]).await.unwrap();
        }

        wire(&net, &ids, SlotRange::full()).await;
        net.management().forward_all(&ids[1]).await.unwrap();

        let new_tail = net.block(&ids[2]).unwrap();
        let n = new_tail.run_command(kv::NUM_KEYS, vec![]).await.unwrap();
        assert_eq!(n, vec!["10".to_string()]);
        assert_eq!(new_tail.pending_len(), 0);
    }

    #[tokio::test]
    async fn dead_node_refuses_management() {
        let net = network();
        let ids = three_nodes(&net);
        let mgmt = net.management();
        mgmt.ping(&ids[0]).await.unwrap();
        net.kill(&ids[0]);
        assert!(matches!(mgmt.ping(&ids[0]).await, Err(ProtocolError::ConnectionClosed)));
        net.revive(&ids[0]);
        mgmt.ping(&ids[0]).await.unwrap();

        let unknown = BlockId::new("nowhere", 1, 2, 3, 4, 0);
        assert!(matches!(mgmt.ping(&unknown).await, Err(ProtocolError::BlockNotFound(_))));
    }

    #[tokio::test]
    async fn lock_excludes_a_second_locker() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids[..1], SlotRange::full()).await;

        let mut first = LockedClient::lock(client(&net, &ids[..1], SlotRange::full())).await.unwrap();
        let second = tokio::spawn({
            let c = client(&net, &ids[..1], SlotRange::full());
            async move { LockedClient::lock(c).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second lock acquired while the first is held");

        first.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn export_moves_keys_between_chains() {
        let net = network();
        let ids = three_nodes(&net);
        let (low, high) = SlotRange::full().split();
        wire(&net, &ids[..1], SlotRange::full()).await;
        let mut c = client(&net, &ids[..1], SlotRange::full());
        let keys: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        for k in &keys {
            c.run_command(kv::PUT, vec![k.clone(), format!("v{k}")]).await.unwrap();
        }

        let mgmt = net.management();
        let dst = vec![ids[1].clone()];
        mgmt.setup_and_set_importing(&ids[1], "/f", high, &dst, ChainRole::Singleton, None)
            .await
            .unwrap();
        mgmt.set_exporting(&ids[0], &dst, high).await.unwrap();
        mgmt.export_slots(&ids[0]).await.unwrap();
        mgmt.set_regular(&ids[0], low).await.unwrap();
        mgmt.set_regular(&ids[1], high).await.unwrap();

        let src = net.block(&ids[0]).unwrap();
        let dst = net.block(&ids[1]).unwrap();
        for k in &keys {
            let slot = slotkv_types::hash_slot(k);
            let (owner, other) = if low.contains(slot) { (&src, &dst) } else { (&dst, &src) };
            assert_eq!(owner.run_command(kv::GET, vec![k.clone()]).await.unwrap(), vec![format!("v{k}")]);
            assert_eq!(
                other.run_command(kv::GET, vec![k.clone()]).await.unwrap(),
                vec![reply::BLOCK_MOVED.to_string()]
            );
        }
        assert!(!src.partition().is_locked());
        assert!(!dst.partition().is_locked());
    }

    #[tokio::test]
    async fn export_requires_exporting_state() {
        let net = network();
        let ids = three_nodes(&net);
        wire(&net, &ids[..1], SlotRange::full()).await;
        assert!(net.management().export_slots(&ids[0]).await.is_err());
    }
}
