//! End-to-end behaviour of the directory over an in-process cluster.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use slotkv_client::{ClientConfig, ClientError, KvClient, LockedClient, ReplicaChainClient};
use slotkv_protocol::DirectoryService;
use slotkv_storage::{InMemorySnapshotStore, KvConfig, LocalNetwork};
use slotkv_types::{hash_slot, kv, kv_ops, reply, ChainStatus, DataFlags, DataStatus, SlotRange, StorageMode, SLOT_MAX};

use crate::{DirectoryError, DirectoryTree, RandomBlockAllocator};

fn client_config() -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

struct Cluster {
    net: Arc<LocalNetwork>,
    tree: Arc<DirectoryTree>,
}

fn cluster(nodes: usize, blocks_per_node: u32, kv: KvConfig) -> Cluster {
    let net = LocalNetwork::new(Arc::new(InMemorySnapshotStore::new()), client_config());
    for _ in 0..nodes {
        net.add_node(blocks_per_node, kv.clone());
    }
    let allocator = Arc::new(RandomBlockAllocator::with_blocks(&net.block_ids()));
    let tree = Arc::new(DirectoryTree::new(net.management(), allocator));
    net.set_directory(tree.clone());
    Cluster { net, tree }
}

impl Cluster {
    async fn client(&self, path: &str) -> KvClient {
        KvClient::open(self.net.transport(), self.tree.clone(), path, client_config())
            .await
            .unwrap()
    }

    fn free_blocks(&self) -> usize {
        self.tree.allocator().num_free_blocks()
    }

    async fn num_keys(&self, block: &slotkv_types::BlockId) -> u64 {
        let n = self.net.block(block).unwrap().run_command(kv::NUM_KEYS, vec![]).await.unwrap();
        n[0].parse().unwrap()
    }
}

async fn wait_for_layout(tree: &DirectoryTree, path: &str, chains: usize) -> DataStatus {
    for _ in 0..500 {
        let status = tree.open(path).await.unwrap();
        if status.chains.len() == chains && status.chains.iter().all(|c| c.status == ChainStatus::Stable) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{path} never settled into {chains} stable chains");
}

#[tokio::test]
async fn put_and_get_on_one_chain() {
    let c = cluster(1, 1, KvConfig::default());
    c.tree.create("/a", "", 1, 1, 0).await.unwrap();
    let mut client = c.client("/a").await;
    for i in 0..1000 {
        client.put(&i.to_string(), &format!("v{i}")).await.unwrap();
    }
    for i in (0..1000).step_by(37) {
        assert_eq!(client.get(&i.to_string()).await.unwrap(), format!("v{i}"));
    }
    assert!(matches!(client.get("1500").await, Err(ClientError::KeyNotFound)));
    assert!(matches!(client.put("7", "again").await, Err(ClientError::DuplicateKey)));
    assert_eq!(client.num_keys().await.unwrap(), 1000);
}

#[tokio::test]
async fn overloaded_block_splits_itself() {
    let kv_config = KvConfig {
        capacity: 2048,
        ..KvConfig::default()
    };
    // Exactly two blocks: the file's one and the split's.
    let c = cluster(2, 1, kv_config);
    c.tree.create("/b", "", 1, 1, 0).await.unwrap();
    let mut client = c.client("/b").await;
    let keys: Vec<String> = (0..300).map(|i| format!("key{i}")).collect();
    for k in &keys {
        client.put(k, &format!("value-{k}")).await.unwrap();
    }

    let status = wait_for_layout(&c.tree, "/b", 2).await;
    assert!(status.is_tiled());
    assert_eq!(c.free_blocks(), 0);
    let (low, high) = SlotRange::full().split();
    assert_eq!(status.chains[0].slot_range, low);
    assert_eq!(status.chains[1].slot_range, high);

    let lower = c.net.block(&status.chains[0].blocks[0]).unwrap();
    let upper = c.net.block(&status.chains[1].blocks[0]).unwrap();
    for k in &keys {
        let (owner, other) = if low.contains(hash_slot(k)) { (&lower, &upper) } else { (&upper, &lower) };
        assert_eq!(owner.run_command(kv::GET, vec![k.clone()]).await.unwrap(), vec![format!("value-{k}")]);
        assert_eq!(
            other.run_command(kv::GET, vec![k.clone()]).await.unwrap(),
            vec![reply::BLOCK_MOVED.to_string()]
        );
    }
    for k in keys.iter().step_by(13) {
        assert_eq!(client.get(k).await.unwrap(), format!("value-{k}"));
    }
}

#[tokio::test]
async fn explicit_split_moves_the_upper_half() {
    let c = cluster(2, 2, KvConfig::default());
    c.tree.create("/s", "", 1, 1, DataFlags::STATIC_PROVISIONED).await.unwrap();
    let mut client = c.client("/s").await;
    for i in 0..200 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }

    c.tree.split_slot_range("/s", SlotRange::full()).await.unwrap();
    let status = c.tree.open("/s").await.unwrap();
    assert_eq!(status.chains.len(), 2);
    assert!(status.is_tiled());
    let moved = c.num_keys(&status.chains[1].blocks[0]).await;
    let kept = c.num_keys(&status.chains[0].blocks[0]).await;
    assert_eq!(moved + kept, 200);
    assert!(moved > 0 && kept > 0);

    // The stale client follows block_moved back to the directory.
    for i in 0..200 {
        assert_eq!(client.get(&format!("k{i}")).await.unwrap(), "v");
    }
    assert_eq!(c.tree.num_chains("/s").await.unwrap(), 2);
}

#[tokio::test]
async fn split_of_unknown_range_is_refused() {
    let c = cluster(1, 2, KvConfig::default());
    c.tree.create("/s", "", 1, 1, 0).await.unwrap();
    let err = c
        .tree
        .split_slot_range("/s", SlotRange { begin: 0, end: 10 })
        .await
        .unwrap_err();
    assert!(matches!(err, DirectoryError::NoSuchRange { .. }));
    assert!(matches!(
        c.tree.split_slot_range("/nope", SlotRange::full()).await,
        Err(DirectoryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn failed_split_leaves_the_layout_alone() {
    let c = cluster(1, 1, KvConfig::default());
    c.tree.create("/s", "", 1, 1, 0).await.unwrap();
    let err = c.tree.split_slot_range("/s", SlotRange::full()).await.unwrap_err();
    assert!(matches!(err, DirectoryError::InsufficientBlocks { .. }));
    let status = c.tree.open("/s").await.unwrap();
    assert_eq!(status.chains.len(), 1);
    assert_eq!(status.chains[0].status, ChainStatus::Stable);

    let mut client = c.client("/s").await;
    client.put("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), "v");
}

#[tokio::test]
async fn abandoned_export_restores_both_chains() {
    let c = cluster(2, 1, KvConfig::default());
    c.tree.create("/u", "", 1, 1, DataFlags::STATIC_PROVISIONED).await.unwrap();
    let mut client = c.client("/u").await;
    for i in 0..200 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }
    let free = c.free_blocks();
    let source = c.tree.open("/u").await.unwrap().chains[0].clone();
    let destination = c
        .net
        .block_ids()
        .into_iter()
        .find(|b| !source.blocks.contains(b))
        .unwrap();

    // Hold the source so the export parks on its first lock.
    let held = ReplicaChainClient::new(
        c.net.transport(),
        None,
        "/u".to_string(),
        source.clone(),
        kv_ops(),
        Duration::from_secs(2),
    );
    let mut held = LockedClient::lock(held).await.unwrap();
    let split = tokio::spawn({
        let tree = c.tree.clone();
        async move { tree.split_slot_range("/u", SlotRange::full()).await }
    });
    for _ in 0..500 {
        if c.tree.open("/u").await.unwrap().chains[0].status == ChainStatus::Exporting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(c.tree.open("/u").await.unwrap().chains[0].status, ChainStatus::Exporting);
    assert!(c.net.kill(&destination));
    held.unlock().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), split).await.unwrap().unwrap();
    assert!(result.is_err());
    let status = c.tree.open("/u").await.unwrap();
    assert_eq!(status.chains.len(), 1);
    assert_eq!(status.chains[0].status, ChainStatus::Stable);
    assert_eq!(status.chains[0].slot_range, SlotRange::full());
    assert_eq!(c.free_blocks(), free);
    assert_eq!(c.num_keys(&source.blocks[0]).await, 200);
    assert_eq!(client.get("k7").await.unwrap(), "v");

    assert!(c.net.revive(&destination));
    c.tree.split_slot_range("/u", SlotRange::full()).await.unwrap();
    let status = wait_for_layout(&c.tree, "/u", 2).await;
    assert_eq!(status.chains[1].blocks, vec![destination]);
    let mut client = c.client("/u").await;
    for i in 0..200 {
        assert_eq!(client.get(&format!("k{i}")).await.unwrap(), "v");
    }
}

#[tokio::test]
async fn merge_folds_a_chain_into_its_neighbour() {
    let c = cluster(2, 1, KvConfig::default());
    c.tree.create("/c", "", 2, 1, DataFlags::STATIC_PROVISIONED).await.unwrap();
    let mut client = c.client("/c").await;
    for i in 0..200 {
        client.put(&format!("k{i}"), &i.to_string()).await.unwrap();
    }
    let before = c.tree.open("/c").await.unwrap();
    assert_eq!(c.free_blocks(), 0);

    c.tree.merge_slot_range("/c", before.chains[0].slot_range).await.unwrap();
    let after = c.tree.open("/c").await.unwrap();
    assert_eq!(after.chains.len(), 1);
    assert_eq!(after.chains[0].slot_range, SlotRange::full());
    assert_eq!(after.chains[0].blocks, before.chains[1].blocks);
    assert_eq!(c.free_blocks(), 1);
    assert_eq!(c.num_keys(&after.chains[0].blocks[0]).await, 200);

    for i in 0..200 {
        assert_eq!(client.get(&format!("k{i}")).await.unwrap(), i.to_string());
    }
}

#[tokio::test]
async fn merge_needs_a_partner() {
    let c = cluster(1, 2, KvConfig::default());
    c.tree.create("/c", "", 1, 1, 0).await.unwrap();
    let err = c.tree.merge_slot_range("/c", SlotRange::full()).await.unwrap_err();
    assert!(matches!(err, DirectoryError::NoMergePartner { .. }));

    c.tree.create("/d", "", 2, 1, DataFlags::STATIC_PROVISIONED).await.unwrap();
    let status = c.tree.open("/d").await.unwrap();
    let last = status.chains[1].slot_range;
    assert_eq!(last.end, SLOT_MAX);
    assert!(matches!(
        c.tree.merge_slot_range("/d", last).await,
        Err(DirectoryError::NoMergePartner { .. })
    ));
}

#[tokio::test]
async fn head_failure_is_repaired_transparently() {
    let c = cluster(3, 1, KvConfig::default());
    c.tree.create("/d", "", 1, 3, 0).await.unwrap();
    let mut client = c.client("/d").await;
    for i in 0..50 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }

    let chain = c.tree.open("/d").await.unwrap().chains[0].clone();
    assert!(c.net.kill(&chain.blocks[0]));
    for i in 50..100 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(client.get(&format!("k{i}")).await.unwrap(), "v");
    }

    let repaired = c.tree.open("/d").await.unwrap().chains[0].clone();
    assert_eq!(repaired.blocks, chain.blocks[1..].to_vec());
    for block in &repaired.blocks {
        assert_eq!(c.num_keys(block).await, 100);
    }
}

#[tokio::test]
async fn mid_failure_replays_pending_requests() {
    let c = cluster(3, 1, KvConfig::default());
    c.tree.create("/m", "", 1, 3, 0).await.unwrap();
    let mut client = c.client("/m").await;
    for i in 0..20 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }
    let chain = c.tree.open("/m").await.unwrap().chains[0].clone();
    c.net.kill(&chain.blocks[1]);

    let repaired = c.tree.resolve_failures("/m", &chain).await.unwrap();
    assert_eq!(repaired.blocks, vec![chain.blocks[0].clone(), chain.blocks[2].clone()]);

    let mut client = c.client("/m").await;
    client.put("after", "v").await.unwrap();
    assert_eq!(c.num_keys(&chain.blocks[2]).await, 21);
    assert_eq!(client.get("after").await.unwrap(), "v");
}

#[tokio::test]
async fn chain_with_no_survivors_cannot_be_repaired() {
    let c = cluster(2, 1, KvConfig::default());
    c.tree.create("/x", "", 1, 2, 0).await.unwrap();
    let chain = c.tree.open("/x").await.unwrap().chains[0].clone();
    for block in &chain.blocks {
        c.net.kill(block);
    }
    assert!(matches!(
        c.tree.resolve_failures("/x", &chain).await,
        Err(DirectoryError::AllReplicasFailed { .. })
    ));
    assert_eq!(c.tree.open("/x").await.unwrap().chains[0], chain);
}

#[tokio::test]
async fn new_replica_receives_existing_data() {
    let c = cluster(2, 1, KvConfig::default());
    c.tree.create("/r", "", 1, 1, 0).await.unwrap();
    let mut client = c.client("/r").await;
    for i in 0..30 {
        client.put(&format!("k{i}"), "v").await.unwrap();
    }
    let chain = c.tree.open("/r").await.unwrap().chains[0].clone();

    let updated = c.tree.add_replica_to_chain("/r", &chain).await.unwrap();
    assert_eq!(updated.len(), 2);
    assert_eq!(updated.blocks[0], chain.blocks[0]);
    assert_eq!(c.num_keys(&updated.blocks[1]).await, 30);
    assert_eq!(c.tree.open("/r").await.unwrap().chains[0], updated);

    let mut client = c.client("/r").await;
    client.put("k30", "v").await.unwrap();
    for block in &updated.blocks {
        assert_eq!(c.num_keys(block).await, 31);
    }
}

#[tokio::test]
async fn lock_is_exclusive_across_clients() {
    let c = cluster(1, 1, KvConfig::default());
    c.tree.create("/e", "", 1, 1, 0).await.unwrap();
    let chain = c.tree.open("/e").await.unwrap().chains[0].clone();
    let directory: Arc<dyn DirectoryService> = c.tree.clone();
    let chain_client = || {
        ReplicaChainClient::new(
            c.net.transport(),
            Some(Arc::clone(&directory)),
            "/e".to_string(),
            chain.clone(),
            kv_ops(),
            Duration::from_secs(2),
        )
    };

    let mut first = LockedClient::lock(chain_client()).await.unwrap();
    let r = first
        .run_command(kv::LOCKED_PUT, vec!["k".to_string(), "v".to_string()])
        .await
        .unwrap();
    assert_eq!(r, vec![reply::OK.to_string()]);

    let second = tokio::spawn({
        let c = chain_client();
        async move { LockedClient::lock(c).await.map(|_| ()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    first.unlock().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn commands_on_a_locked_chain_time_out() {
    let c = cluster(1, 1, KvConfig::default());
    c.tree.create("/t", "", 1, 1, 0).await.unwrap();
    let chain = c.tree.open("/t").await.unwrap().chains[0].clone();
    let held = ReplicaChainClient::new(
        c.net.transport(),
        None,
        "/t".to_string(),
        chain,
        kv_ops(),
        Duration::from_secs(2),
    );
    let mut held = LockedClient::lock(held).await.unwrap();

    let config = ClientConfig {
        timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let mut client = KvClient::open(c.net.transport(), c.tree.clone(), "/t", config)
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(3), client.put("k", "v"))
        .await
        .expect("put should give up on its own")
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    held.unlock().await.unwrap();
    client.put("after", "v").await.unwrap();
    assert_eq!(client.get("after").await.unwrap(), "v");
}

#[tokio::test]
async fn dump_and_load_round_trip() {
    let c = cluster(1, 4, KvConfig::default());
    c.tree.create("/m", "mem://m", 2, 1, 0).await.unwrap();
    let mut client = c.client("/m").await;
    for i in 0..50 {
        client.put(&format!("k{i}"), &i.to_string()).await.unwrap();
    }
    assert_eq!(c.free_blocks(), 2);

    c.tree.dump("/m", "mem://m").await.unwrap();
    let dumped = c.tree.open("/m").await.unwrap();
    assert!(dumped.chains.iter().all(|ch| ch.mode == StorageMode::OnDisk));
    assert_eq!(c.free_blocks(), 4);

    c.tree.load("/m", "mem://m").await.unwrap();
    let loaded = c.tree.open("/m").await.unwrap();
    assert!(loaded.chains.iter().all(|ch| ch.mode == StorageMode::InMemory));
    assert!(loaded.is_tiled());
    assert_eq!(c.free_blocks(), 2);

    let mut client = c.client("/m").await;
    for i in 0..50 {
        assert_eq!(client.get(&format!("k{i}")).await.unwrap(), i.to_string());
    }
}

#[tokio::test]
async fn lease_expiry_follows_the_flags() {
    let c = cluster(1, 3, KvConfig::default());
    c.tree.create("/pinned", "", 1, 1, DataFlags::PINNED).await.unwrap();
    c.tree.create("/mapped", "mem://mapped", 1, 1, DataFlags::MAPPED).await.unwrap();
    c.tree.create("/plain", "", 1, 1, 0).await.unwrap();
    c.client("/mapped").await.put("k", "v").await.unwrap();
    assert_eq!(c.free_blocks(), 0);

    for path in ["/pinned", "/mapped", "/plain"] {
        c.tree.handle_lease_expiry(path).await.unwrap();
    }

    assert_eq!(c.tree.open("/pinned").await.unwrap().chains[0].mode, StorageMode::InMemory);
    assert_eq!(c.tree.open("/mapped").await.unwrap().chains[0].mode, StorageMode::OnDisk);
    assert!(!c.tree.exists("/plain").unwrap());
    assert_eq!(c.free_blocks(), 2);

    c.tree.load("/mapped", "mem://mapped").await.unwrap();
    assert_eq!(c.client("/mapped").await.get("k").await.unwrap(), "v");
}

#[tokio::test]
async fn create_and_remove_manage_the_pool() {
    let c = cluster(2, 2, KvConfig::default());
    c.tree.create("/f", "", 2, 2, 0).await.unwrap();
    assert_eq!(c.free_blocks(), 0);
    assert!(matches!(
        c.tree.create("/f", "", 1, 1, 0).await,
        Err(DirectoryError::AlreadyExists { .. })
    ));
    assert!(matches!(
        c.tree.create("/g", "", 1, 1, 0).await,
        Err(DirectoryError::InsufficientBlocks { .. })
    ));
    assert!(!c.tree.exists("/g").unwrap());

    let again = c.tree.open_or_create("/f", "", 1, 1, 0).await.unwrap();
    assert_eq!(again.chains.len(), 2);

    c.tree.remove("/f").await.unwrap();
    assert_eq!(c.free_blocks(), 4);
    assert!(matches!(c.tree.open("/f").await, Err(DirectoryError::NotFound { .. })));
    assert!(c.tree.paths().is_empty());
}

#[tokio::test]
async fn replicas_land_on_distinct_nodes() {
    let c = cluster(3, 2, KvConfig::default());
    c.tree.create("/f", "", 2, 3, 0).await.unwrap();
    for chain in c.tree.open("/f").await.unwrap().chains {
        let mut prefixes: Vec<String> = chain.blocks.iter().map(|b| b.node_prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), 3);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn layout_stays_tiled_through_splits_and_merges(
        steps in prop::collection::vec((any::<bool>(), any::<u8>()), 1..10)
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let c = cluster(2, 4, KvConfig::default());
            c.tree.create("/p", "", 1, 1, DataFlags::STATIC_PROVISIONED).await.unwrap();
            let mut client = c.client("/p").await;
            for i in 0..64 {
                client.put(&format!("k{i}"), "v").await.unwrap();
            }

            for (split, pick) in steps {
                let status = c.tree.open("/p").await.unwrap();
                let range = status.chains[pick as usize % status.chains.len()].slot_range;
                // Running out of blocks or partners is fine; the layout must hold either way.
                let _ = if split {
                    c.tree.split_slot_range("/p", range).await
                } else {
                    c.tree.merge_slot_range("/p", range).await
                };
                let status = c.tree.open("/p").await.unwrap();
                assert!(status.is_tiled(), "gap or overlap in {:?}", status.chains);
                assert!(status.chains.iter().all(|ch| ch.status == ChainStatus::Stable));
                assert_eq!(c.tree.allocator().num_allocated_blocks(), status.chains.len());
            }

            assert_eq!(c.client("/p").await.num_keys().await.unwrap(), 64);
        });
    }
}
