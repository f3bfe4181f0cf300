use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use slotkv_protocol::{BlockConnection, CommandResponse, DirectoryService, ProtocolError, Transport};
use slotkv_types::ops::kv;
use slotkv_types::{reply, BlockId, OpTable, ReplicaChain, Reply, SequenceId, SlotRange};

use crate::error::{ClientError, ClientResult};

/// Open connections to one chain's head and tail.
struct ChainSession {
    head: Arc<dyn BlockConnection>,
    tail: Arc<dyn BlockConnection>,
    responses: mpsc::Receiver<CommandResponse>,
    seq: SequenceId,
}

impl ChainSession {
    async fn roundtrip(
        &mut self,
        ops: &OpTable,
        timeout: Duration,
        op_id: i32,
        args: Vec<String>,
    ) -> ClientResult<Vec<String>> {
        self.seq.client_seq_no += 1;
        let seq = self.seq;
        let target = if ops.is_accessor(op_id) { &self.tail } else { &self.head };
        let responses = &mut self.responses;
        // A block parks requests while its partition is locked, so the send
        // can stall as long as the receive.
        let exchange = async {
            target
                .command_request(seq, op_id, args)
                .await
                .map_err(|e| match e {
                    // The block refused the request because of its chain position.
                    ProtocolError::RemoteError { .. } => ClientError::BlockMoved,
                    other => other.into(),
                })?;
            let response = responses.recv().await.ok_or(ProtocolError::ConnectionClosed)?;
            Ok::<_, ClientError>(response)
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        if response.seq.client_seq_no != seq.client_seq_no {
            error!(
                expected = seq.client_seq_no,
                got = response.seq.client_seq_no,
                client_id = seq.client_id,
                "response sequence mismatch"
            );
            return Err(ClientError::BlockMoved);
        }
        Ok(response.result)
    }
}

/// Client proxy for a single replica chain.
///
/// Holds at most one request in flight. Connections are opened lazily on the
/// first command, so constructing a client never touches the network.
///
/// [`run_command`](Self::run_command) returns replies as the chain produced
/// them; [`run_command_following`](Self::run_command_following) also chases
/// `!exporting` replies to the export target.
pub struct ReplicaChainClient {
    transport: Arc<dyn Transport>,
    directory: Option<Arc<dyn DirectoryService>>,
    path: String,
    chain: ReplicaChain,
    ops: OpTable,
    timeout: Duration,
    session: Option<ChainSession>,
}

impl ReplicaChainClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Option<Arc<dyn DirectoryService>>,
        path: impl Into<String>,
        chain: ReplicaChain,
        ops: OpTable,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            directory,
            path: path.into(),
            chain,
            ops,
            timeout,
            session: None,
        }
    }

    pub fn chain(&self) -> &ReplicaChain {
        &self.chain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ops(&self) -> &OpTable {
        &self.ops
    }

    /// Connect now instead of on the first command.
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.session.is_none() {
            self.session = Some(self.open_session().await?);
        }
        Ok(())
    }

    async fn open_session(&self) -> ClientResult<ChainSession> {
        let head_id = self.chain.head().ok_or(ClientError::EmptyChain)?;
        let tail_id = self.chain.tail().ok_or(ClientError::EmptyChain)?;
        let open = async {
            let head = self.transport.connect(head_id).await?;
            let tail = if self.chain.len() == 1 {
                Arc::clone(&head)
            } else {
                self.transport.connect(tail_id).await?
            };
            let client_id = head.get_client_id().await?;
            let responses = tail.register_client_id(client_id).await?;
            debug!(client_id, head = %head_id, tail = %tail_id, "connected to chain");
            Ok::<_, ClientError>(ChainSession {
                head,
                tail,
                responses,
                seq: SequenceId::new(client_id, 0),
            })
        };
        tokio::time::timeout(self.timeout, open)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn try_run(&mut self, op_id: i32, args: Vec<String>) -> ClientResult<Vec<String>> {
        if self.session.is_none() {
            self.session = Some(self.open_session().await?);
        }
        let result = match self.session.as_mut() {
            Some(session) => session.roundtrip(&self.ops, self.timeout, op_id, args).await,
            None => Err(ProtocolError::ConnectionClosed.into()),
        };
        if result.is_err() {
            self.session = None;
        }
        result
    }

    /// Ask the directory to repair the chain, then reconnect.
    async fn repair(&mut self) -> ClientResult<()> {
        self.session = None;
        if let Some(directory) = &self.directory {
            let fixed = directory.resolve_failures(&self.path, &self.chain).await?;
            info!(path = %self.path, chain = %fixed, "chain repaired");
            self.chain = fixed;
        }
        self.session = Some(self.open_session().await?);
        Ok(())
    }

    /// Run a command against the chain.
    ///
    /// A transport failure triggers one repair-and-retry. A retried put may
    /// already have been applied, so `!duplicate_key` from a retried put
    /// counts as success.
    pub async fn run_command(&mut self, op_id: i32, args: Vec<String>) -> ClientResult<Vec<String>> {
        match self.try_run(op_id, args.clone()).await {
            Err(e) if e.is_transport() => {
                warn!(path = %self.path, chain = %self.chain, error = %e, "transport failure; repairing chain");
                self.repair().await?;
                let mut result = self.try_run(op_id, args).await?;
                if matches!(op_id, kv::PUT | kv::LOCKED_PUT) {
                    for r in result.iter_mut().filter(|r| r.as_str() == reply::DUPLICATE_KEY) {
                        *r = reply::OK.to_string();
                    }
                }
                Ok(result)
            }
            other => other,
        }
    }

    /// Run a command, re-issuing it marked redirected on the export target
    /// while the first reply is `!exporting`. Each target gets a throwaway
    /// client.
    pub async fn run_command_following(
        &mut self,
        op_id: i32,
        args: Vec<String>,
        max_redirects: usize,
    ) -> ClientResult<Vec<String>> {
        let mut result = self.run_command(op_id, args.clone()).await?;
        let mut redirects = 0;
        while let Some(Reply::Exporting(target)) = result.first().map(|r| Reply::parse(r)).transpose()? {
            if redirects == max_redirects {
                return Err(ClientError::TooManyRedirects(max_redirects));
            }
            redirects += 1;
            debug!(path = %self.path, target = %BlockId::join_chain(&target), "following exporting redirect");
            let mut client = Self::new(
                Arc::clone(&self.transport),
                self.directory.clone(),
                self.path.clone(),
                ReplicaChain::new(target, SlotRange::EMPTY),
                self.ops.clone(),
                self.timeout,
            );
            result = client.run_command_redirected(op_id, args.clone()).await?;
        }
        Ok(result)
    }

    /// Run a command marked as redirected from an exporting block.
    pub async fn run_command_redirected(&mut self, op_id: i32, mut args: Vec<String>) -> ClientResult<Vec<String>> {
        args.push(reply::REDIRECTED.to_string());
        self.run_command(op_id, args).await
    }

    /// Subscribe to notifications from the chain tail.
    pub async fn subscribe(&mut self, ops: Vec<String>) -> ClientResult<mpsc::Receiver<slotkv_protocol::Notification>> {
        self.connect().await?;
        match &self.session {
            Some(session) => Ok(session.tail.subscribe(ops).await?),
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}

impl std::fmt::Debug for ReplicaChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaChainClient")
            .field("path", &self.path)
            .field("chain", &self.chain.to_string())
            .field("connected", &self.session.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use slotkv_protocol::{
        BlockConnection, ChainConnection, CommandResponse, DirectoryService, Notification,
        ProtocolError, ProtocolResult, Transport, CHANNEL_CAPACITY,
    };
    use slotkv_types::{BlockId, DataFlags, DataStatus, ReplicaChain, SequenceId, SlotRange};

    pub type Handler = Arc<dyn Fn(&BlockId, i32, &[String]) -> Vec<String> + Send + Sync>;

    /// Scripted stand-in for a set of storage blocks.
    pub struct FakeTransport {
        handler: Handler,
        next_client: AtomicI64,
        clients: Mutex<HashMap<i64, mpsc::Sender<CommandResponse>>>,
        pub fail_sends: AtomicUsize,
        pub stall_sends: AtomicBool,
        pub mangle_seq: AtomicBool,
        pub requests: Mutex<Vec<(BlockId, i32, Vec<String>)>>,
    }

    impl FakeTransport {
        pub fn new(handler: impl Fn(&BlockId, i32, &[String]) -> Vec<String> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Arc::new(handler),
                next_client: AtomicI64::new(0),
                clients: Mutex::new(HashMap::new()),
                fail_sends: AtomicUsize::new(0),
                stall_sends: AtomicBool::new(false),
                mangle_seq: AtomicBool::new(false),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn echo() -> Arc<Self> {
            Self::new(|_, _, args| args.to_vec())
        }
    }

    struct FakeConnection {
        block: BlockId,
        shared: Arc<FakeTransport>,
    }

    /// Transport handle that can hand out connections sharing the fake state.
    pub struct FakeNetwork(pub Arc<FakeTransport>);

    #[async_trait]
    impl Transport for FakeNetwork {
        async fn connect(&self, block: &BlockId) -> ProtocolResult<Arc<dyn BlockConnection>> {
            Ok(Arc::new(FakeConnection {
                block: block.clone(),
                shared: Arc::clone(&self.0),
            }))
        }

        async fn connect_chain(&self, _block: &BlockId) -> ProtocolResult<ChainConnection> {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    #[async_trait]
    impl BlockConnection for FakeConnection {
        async fn get_client_id(&self) -> ProtocolResult<i64> {
            Ok(self.shared.next_client.fetch_add(1, Ordering::SeqCst))
        }

        async fn register_client_id(&self, client_id: i64) -> ProtocolResult<mpsc::Receiver<CommandResponse>> {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            self.shared.clients.lock().unwrap().insert(client_id, tx);
            Ok(rx)
        }

        async fn command_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()> {
            if self
                .shared
                .fail_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProtocolError::ConnectionClosed);
            }
            if self.shared.stall_sends.load(Ordering::SeqCst) {
                // Like a block holding the request behind a partition lock.
                std::future::pending::<()>().await;
            }
            self.shared
                .requests
                .lock()
                .unwrap()
                .push((self.block.clone(), op_id, args.clone()));
            let result = (self.shared.handler)(&self.block, op_id, &args);
            let mut seq = seq;
            if self.shared.mangle_seq.load(Ordering::SeqCst) {
                seq.client_seq_no += 100;
            }
            let tx = self.shared.clients.lock().unwrap().get(&seq.client_id).cloned();
            if let Some(tx) = tx {
                let _ = tx.send(CommandResponse { seq, result }).await;
            }
            Ok(())
        }

        async fn run_command(&self, op_id: i32, args: Vec<String>) -> ProtocolResult<Vec<String>> {
            Ok((self.shared.handler)(&self.block, op_id, &args))
        }

        async fn subscribe(&self, _ops: Vec<String>) -> ProtocolResult<mpsc::Receiver<Notification>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    /// Directory double that serves a fixed status and records repairs.
    pub struct FakeDirectory {
        pub status: Mutex<DataStatus>,
        pub repairs: AtomicUsize,
        pub lookups: AtomicUsize,
    }

    impl FakeDirectory {
        pub fn new(status: DataStatus) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                repairs: AtomicUsize::new(0),
                lookups: AtomicUsize::new(0),
            })
        }
    }

    fn unsupported<T>() -> ProtocolResult<T> {
        Err(ProtocolError::RemoteError { code: 0, message: "unsupported".into() })
    }

    #[async_trait]
    impl DirectoryService for FakeDirectory {
        async fn create(&self, _: &str, _: &str, _: usize, _: usize, _: u32) -> ProtocolResult<DataStatus> {
            unsupported()
        }
        async fn open(&self, _: &str) -> ProtocolResult<DataStatus> {
            self.dstatus("").await
        }
        async fn open_or_create(&self, _: &str, _: &str, _: usize, _: usize, _: u32) -> ProtocolResult<DataStatus> {
            unsupported()
        }
        async fn exists(&self, _: &str) -> ProtocolResult<bool> {
            Ok(true)
        }
        async fn remove(&self, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
        async fn dstatus(&self, _: &str) -> ProtocolResult<DataStatus> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.status.lock().unwrap().clone())
        }
        async fn add_block_to_file(&self, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
        async fn split_slot_range(&self, _: &str, _: SlotRange) -> ProtocolResult<()> {
            unsupported()
        }
        async fn merge_slot_range(&self, _: &str, _: SlotRange) -> ProtocolResult<()> {
            unsupported()
        }
        async fn resolve_failures(&self, _: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
            self.repairs.fetch_add(1, Ordering::SeqCst);
            Ok(chain.clone())
        }
        async fn add_replica_to_chain(&self, _: &str, _: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
            unsupported()
        }
        async fn handle_lease_expiry(&self, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
        async fn dump(&self, _: &str, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
        async fn load(&self, _: &str, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
        async fn sync(&self, _: &str, _: &str) -> ProtocolResult<()> {
            unsupported()
        }
    }

    pub fn block(id: u32) -> BlockId {
        BlockId::new("fake", 1, 2, 3, 4, id)
    }

    pub fn chain_of(ids: &[u32], range: SlotRange) -> ReplicaChain {
        ReplicaChain::new(ids.iter().map(|&i| block(i)).collect(), range)
    }

    pub fn status_of(chains: Vec<ReplicaChain>) -> DataStatus {
        DataStatus::new("local://fake", chains.first().map_or(1, |c| c.len()), chains, DataFlags::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::*;
    use super::*;
    use slotkv_types::ops::kv;
    use slotkv_types::{kv_ops, SlotRange};

    fn client(net: &Arc<FakeTransport>, ids: &[u32], dir: Option<Arc<FakeDirectory>>) -> ReplicaChainClient {
        ReplicaChainClient::new(
            Arc::new(FakeNetwork(Arc::clone(net))),
            dir.map(|d| d as Arc<dyn DirectoryService>),
            "/file",
            chain_of(ids, SlotRange::full()),
            kv_ops(),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn mutators_go_to_head_accessors_to_tail() {
        let net = FakeTransport::echo();
        let mut c = client(&net, &[0, 1, 2], None);
        c.run_command(kv::PUT, vec!["k".into(), "v".into()]).await.unwrap();
        c.run_command(kv::GET, vec!["k".into()]).await.unwrap();
        let reqs = net.requests.lock().unwrap().clone();
        assert_eq!(reqs[0].0, block(0));
        assert_eq!(reqs[0].1, kv::PUT);
        assert_eq!(reqs[1].0, block(2));
        assert_eq!(reqs[1].1, kv::GET);
    }

    #[tokio::test]
    async fn redirected_marker_is_appended() {
        let net = FakeTransport::echo();
        let mut c = client(&net, &[0], None);
        let out = c.run_command_redirected(kv::GET, vec!["k".into()]).await.unwrap();
        assert_eq!(out, vec!["k".to_string(), reply::REDIRECTED.to_string()]);
    }

    #[tokio::test]
    async fn sequence_mismatch_is_block_moved() {
        let net = FakeTransport::echo();
        net.mangle_seq.store(true, Ordering::SeqCst);
        let mut c = client(&net, &[0], None);
        let err = c.run_command(kv::GET, vec!["k".into()]).await.unwrap_err();
        assert!(matches!(err, ClientError::BlockMoved));
    }

    #[tokio::test]
    async fn transport_failure_repairs_and_retries_once() {
        let net = FakeTransport::new(|_, _, _| vec![reply::DUPLICATE_KEY.to_string()]);
        net.fail_sends.store(1, Ordering::SeqCst);
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = client(&net, &[0], Some(Arc::clone(&dir)));
        let out = c.run_command(kv::PUT, vec!["k".into(), "v".into()]).await.unwrap();
        assert_eq!(dir.repairs.load(Ordering::SeqCst), 1);
        // The retry may have re-applied an earlier put.
        assert_eq!(out, vec![reply::OK.to_string()]);
    }

    #[tokio::test]
    async fn duplicate_key_survives_a_retried_update() {
        let net = FakeTransport::new(|_, _, _| vec![reply::DUPLICATE_KEY.to_string()]);
        net.fail_sends.store(1, Ordering::SeqCst);
        let dir = FakeDirectory::new(status_of(vec![chain_of(&[0], SlotRange::full())]));
        let mut c = client(&net, &[0], Some(Arc::clone(&dir)));
        let out = c.run_command(kv::UPDATE, vec!["k".into(), "v".into()]).await.unwrap();
        assert_eq!(dir.repairs.load(Ordering::SeqCst), 1);
        assert_eq!(out, vec![reply::DUPLICATE_KEY.to_string()]);
    }

    #[tokio::test]
    async fn stalled_send_times_out() {
        let net = FakeTransport::echo();
        net.stall_sends.store(true, Ordering::SeqCst);
        let mut c = client(&net, &[0], None);
        let err = tokio::time::timeout(
            Duration::from_secs(3),
            c.run_command(kv::PUT, vec!["k".into(), "v".into()]),
        )
        .await
        .expect("command should give up on its own")
        .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn second_transport_failure_is_surfaced() {
        let net = FakeTransport::echo();
        net.fail_sends.store(2, Ordering::SeqCst);
        let mut c = client(&net, &[0], None);
        let err = c.run_command(kv::PUT, vec!["k".into(), "v".into()]).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn exporting_reply_is_followed_to_the_target() {
        let redirect = reply::exporting(&[block(5)]);
        let net = FakeTransport::new(move |b, _, args| match b.id {
            0 => vec![redirect.clone()],
            _ => vec![format!("{}:{}", b.id, args.join(","))],
        });
        let mut c = client(&net, &[0], None);
        let raw = c.run_command(kv::GET, vec!["k".into()]).await.unwrap();
        assert_eq!(raw, vec![reply::exporting(&[block(5)])]);
        let out = c.run_command_following(kv::GET, vec!["k".into()], 4).await.unwrap();
        assert_eq!(out, vec![format!("5:k,{}", reply::REDIRECTED)]);
    }

    #[tokio::test]
    async fn redirect_cycle_is_cut_off() {
        let net = FakeTransport::new(|b, _, _| vec![reply::exporting(&[block(b.id + 1)])]);
        let mut c = client(&net, &[0], None);
        let err = c.run_command_following(kv::GET, vec!["k".into()], 3).await.unwrap_err();
        assert!(matches!(err, ClientError::TooManyRedirects(3)));
        assert_eq!(net.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_chain_is_rejected() {
        let net = FakeTransport::echo();
        let mut c = client(&net, &[], None);
        assert!(matches!(c.connect().await, Err(ClientError::EmptyChain)));
    }
}
