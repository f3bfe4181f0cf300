use std::sync::Arc;

use tracing::{debug, warn};

use slotkv_protocol::{DirectoryService, Transport};
use slotkv_types::ops::kv;
use slotkv_types::{hash_slot, kv_ops, reply, DataStatus, OpTable, ReplicaChain, Reply};

use crate::chain_client::ReplicaChainClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Key-value client for one file.
///
/// Keys are routed to chains by hash slot using a cached [`DataStatus`]. The
/// chain client follows exporting replies to the export target; a
/// `block_moved` reply refreshes the cache from the directory and retries.
pub struct KvClient {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn DirectoryService>,
    path: String,
    config: ClientConfig,
    ops: OpTable,
    status: DataStatus,
    chains: Vec<ReplicaChainClient>,
}

impl KvClient {
    /// Open `path` and fetch its current layout.
    pub async fn open(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DirectoryService>,
        path: impl Into<String>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        let path = path.into();
        let status = directory.dstatus(&path).await?;
        let mut client = Self {
            transport,
            directory,
            path,
            config,
            ops: kv_ops(),
            status: DataStatus::default(),
            chains: Vec::new(),
        };
        client.install(status);
        Ok(client)
    }

    pub fn status(&self) -> &DataStatus {
        &self.status
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn install(&mut self, status: DataStatus) {
        self.chains = status.chains.iter().map(|c| self.chain_client(c.clone())).collect();
        self.status = status;
    }

    fn chain_client(&self, chain: ReplicaChain) -> ReplicaChainClient {
        ReplicaChainClient::new(
            Arc::clone(&self.transport),
            Some(Arc::clone(&self.directory)),
            self.path.clone(),
            chain,
            self.ops.clone(),
            self.config.timeout,
        )
    }

    /// Reload the layout from the directory.
    pub async fn refresh(&mut self) -> ClientResult<()> {
        let status = self.directory.dstatus(&self.path).await?;
        debug!(path = %self.path, chains = status.chains.len(), "refreshed data status");
        self.install(status);
        Ok(())
    }

    /// Run one single-key operation against the owning chain.
    async fn execute(&mut self, op_id: i32, key: &str, args: Vec<String>) -> ClientResult<String> {
        let slot = hash_slot(key);
        let mut refreshes = 0;
        loop {
            let raw = match self.dispatch(slot, op_id, args.clone()).await {
                Ok(raw) => raw,
                Err(ClientError::BlockMoved) => reply::BLOCK_MOVED.to_string(),
                Err(e) => return Err(e),
            };
            if raw != reply::BLOCK_MOVED {
                return Ok(raw);
            }
            if refreshes >= self.config.max_refreshes {
                warn!(path = %self.path, key, refreshes, "giving up after repeated block_moved");
                return Err(ClientError::BlockMoved);
            }
            refreshes += 1;
            self.refresh().await?;
        }
    }

    async fn dispatch(&mut self, slot: i32, op_id: i32, args: Vec<String>) -> ClientResult<String> {
        let index = self
            .status
            .chain_index_for_slot(slot)
            .ok_or(ClientError::NoChainForSlot(slot))?;
        let client = self.chains.get_mut(index).ok_or(ClientError::NoChainForSlot(slot))?;
        first(client.run_command_following(op_id, args, self.config.max_redirects).await?)
    }

    /// Insert a new key. Fails with [`ClientError::DuplicateKey`] if the key exists.
    pub async fn put(&mut self, key: &str, value: &str) -> ClientResult<()> {
        let raw = self.execute(kv::PUT, key, vec![key.to_string(), value.to_string()]).await?;
        expect_ok(raw)
    }

    pub async fn get(&mut self, key: &str) -> ClientResult<String> {
        let raw = self.execute(kv::GET, key, vec![key.to_string()]).await?;
        expect_value(raw)
    }

    /// Replace the value of an existing key, returning the old value.
    pub async fn update(&mut self, key: &str, value: &str) -> ClientResult<String> {
        let raw = self.execute(kv::UPDATE, key, vec![key.to_string(), value.to_string()]).await?;
        expect_value(raw)
    }

    /// Remove a key, returning its value.
    pub async fn remove(&mut self, key: &str) -> ClientResult<String> {
        let raw = self.execute(kv::REMOVE, key, vec![key.to_string()]).await?;
        expect_value(raw)
    }

    pub async fn exists(&mut self, key: &str) -> ClientResult<bool> {
        let raw = self.execute(kv::EXISTS, key, vec![key.to_string()]).await?;
        match Reply::parse(&raw)? {
            Reply::Value(v) => Ok(v == "true"),
            Reply::KeyNotFound => Ok(false),
            other => Err(unexpected(other, raw)),
        }
    }

    /// Number of keys across every chain of the file.
    pub async fn num_keys(&mut self) -> ClientResult<u64> {
        let mut total = 0;
        for client in &mut self.chains {
            let raw = first(client.run_command(kv::NUM_KEYS, Vec::new()).await?)?;
            total += raw.parse::<u64>().map_err(|_| ClientError::UnexpectedReply(raw))?;
        }
        Ok(total)
    }

    /// Every key of the file, chain by chain.
    pub async fn keys(&mut self) -> ClientResult<Vec<String>> {
        let mut keys = Vec::new();
        for client in &mut self.chains {
            keys.extend(client.run_command(kv::KEYS, Vec::new()).await?);
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("path", &self.path)
            .field("chains", &self.chains.len())
            .finish()
    }
}

fn first(result: Vec<String>) -> ClientResult<String> {
    result.into_iter().next().ok_or(ClientError::EmptyResponse)
}

fn unexpected(reply: Reply, raw: String) -> ClientError {
    match reply {
        Reply::KeyNotFound => ClientError::KeyNotFound,
        Reply::DuplicateKey => ClientError::DuplicateKey,
        Reply::BlockMoved => ClientError::BlockMoved,
        Reply::ArgsError => ClientError::ArgsError,
        Reply::BlockNotLocked => ClientError::BlockNotLocked,
        _ => ClientError::UnexpectedReply(raw),
    }
}

fn expect_ok(raw: String) -> ClientResult<()> {
    match Reply::parse(&raw)? {
        Reply::Ok => Ok(()),
        other => Err(unexpected(other, raw)),
    }
}

fn expect_value(raw: String) -> ClientResult<String> {
    match Reply::parse(&raw)? {
        Reply::Value(v) => Ok(v),
        other => Err(unexpected(other, raw)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::chain_client::testing::*;
    use slotkv_types::{BlockId, SlotRange, SLOT_MAX};

    fn config() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        }
    }

    async fn open(net: &Arc<FakeTransport>, dir: &Arc<FakeDirectory>) -> KvClient {
        KvClient::open(
            Arc::new(FakeNetwork(Arc::clone(net))),
            Arc::clone(dir) as Arc<dyn DirectoryService>,
            "/file",
            config(),
        )
        .await
        .unwrap()
    }

    /// A per-block map answering put/get the way a partition would.
    fn store_handler() -> impl Fn(&BlockId, i32, &[String]) -> Vec<String> + Send + Sync + 'static {
        let tables: Arc<Mutex<HashMap<u32, HashMap<String, String>>>> = Arc::default();
        move |b: &BlockId, op: i32, args: &[String]| {
            let mut tables = tables.lock().unwrap();
            let table = tables.entry(b.id).or_default();
            let out = match op {
                kv::PUT => {
                    if table.contains_key(&args[0]) {
                        reply::DUPLICATE_KEY.to_string()
                    } else {
                        table.insert(args[0].clone(), args[1].clone());
                        reply::OK.to_string()
                    }
                }
                kv::GET => table.get(&args[0]).cloned().unwrap_or_else(|| reply::KEY_NOT_FOUND.to_string()),
                kv::EXISTS => {
                    if table.contains_key(&args[0]) { "true".into() } else { reply::KEY_NOT_FOUND.into() }
                }
                kv::NUM_KEYS => table.len().to_string(),
                _ => reply::ARGS_ERROR.to_string(),
            };
            vec![out]
        }
    }

    #[tokio::test]
    async fn routes_by_slot() {
        let net = FakeTransport::new(store_handler());
        let (lo, hi) = SlotRange::full().split();
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], lo), chain_of(&[1], hi)]));
        let mut c = open(&net, &dir).await;

        for i in 0..50 {
            c.put(&i.to_string(), &format!("v{i}")).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(c.get(&i.to_string()).await.unwrap(), format!("v{i}"));
        }
        assert_eq!(c.num_keys().await.unwrap(), 50);

        for (block, op, args) in net.requests.lock().unwrap().iter() {
            if *op == kv::NUM_KEYS {
                continue;
            }
            let slot = hash_slot(&args[0]);
            let expected = if slot <= lo.end { 0 } else { 1 };
            assert_eq!(block.id, expected);
        }
    }

    #[tokio::test]
    async fn typed_errors() {
        let net = FakeTransport::new(store_handler());
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = open(&net, &dir).await;
        c.put("a", "1").await.unwrap();
        assert!(matches!(c.put("a", "2").await, Err(ClientError::DuplicateKey)));
        assert!(matches!(c.get("1500").await, Err(ClientError::KeyNotFound)));
        assert!(c.exists("a").await.unwrap());
        assert!(!c.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn follows_exporting_redirect() {
        let target = vec![block(9)];
        let redirect = reply::exporting(&target);
        let net = FakeTransport::new(move |b, _, args| {
            if b.id == 0 {
                vec![redirect.clone()]
            } else {
                vec![format!("from-{}-{}", b.id, args.join(","))]
            }
        });
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = open(&net, &dir).await;
        let v = c.get("k").await.unwrap();
        assert_eq!(v, format!("from-9-k,{}", reply::REDIRECTED));
    }

    #[tokio::test]
    async fn block_moved_refreshes_then_gives_up() {
        let net = FakeTransport::new(|_, _, _| vec![reply::BLOCK_MOVED.to_string()]);
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = open(&net, &dir).await;
        assert!(matches!(c.get("k").await, Err(ClientError::BlockMoved)));
        // One lookup on open plus one per refresh.
        assert_eq!(dir.lookups.load(Ordering::SeqCst), 1 + config().max_refreshes);
    }

    #[tokio::test]
    async fn block_moved_picks_up_new_layout() {
        let net = FakeTransport::new(|b, _, _| {
            if b.id == 0 {
                vec![reply::BLOCK_MOVED.to_string()]
            } else {
                vec!["fresh".to_string()]
            }
        });
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = open(&net, &dir).await;
        *dir.status.lock().unwrap() = status_of(vec![chain_of(&[1], SlotRange::full())]);
        assert_eq!(c.get("k").await.unwrap(), "fresh");
        assert_eq!(c.status().chains[0].slot_range.end, SLOT_MAX);
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let redirect = reply::exporting(&[block(1)]);
        let net = FakeTransport::new(move |_, _, _| vec![redirect.clone()]);
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = open(&net, &dir).await;
        assert!(matches!(c.get("k").await, Err(ClientError::TooManyRedirects(8))));
    }
}
