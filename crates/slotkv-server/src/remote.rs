//! TCP implementations of the service traits.
//!
//! Request/reply calls use one framed message each way. Response and
//! notification streams get a dedicated connection that the server pushes
//! on. A chain link is a long-lived connection carrying requests downstream
//! and acknowledgments back up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use slotkv_protocol::{
    read_message, write_message, BlockConnection, ChainConnection, ChainLink, CommandResponse, DirectoryRequest,
    DirectoryResponse, DirectoryService, ManagementRequest, ManagementResponse, Message, Notification,
    ProtocolError, ProtocolResult, StorageManagement, Transport, CHANNEL_CAPACITY,
};
use slotkv_types::{BlockId, ChainRole, DataStatus, ReplicaChain, SequenceId, SlotRange};

fn addr(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

fn unexpected(expected: &'static str, got: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        actual: got.type_name(),
    }
}

pub(crate) async fn connect(addr: &str, timeout: Duration) -> ProtocolResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProtocolError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Send `request` and read one reply, turning an `Error` reply into
/// [`ProtocolError::RemoteError`].
async fn roundtrip(stream: &mut TcpStream, request: &Message) -> ProtocolResult<Message> {
    write_message(stream, request).await?;
    match read_message(stream).await? {
        Some(Message::Error { code, message }) => Err(ProtocolError::RemoteError { code, message }),
        Some(reply) => Ok(reply),
        None => Err(ProtocolError::ConnectionClosed),
    }
}

async fn call(addr: &str, timeout: Duration, request: &Message) -> ProtocolResult<Message> {
    let mut stream = connect(addr, timeout).await?;
    roundtrip(&mut stream, request).await
}

/// Opens client and chain connections to blocks over TCP.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, block: &BlockId) -> ProtocolResult<Arc<dyn BlockConnection>> {
        let stream = connect(&addr(&block.host, block.service_port), self.timeout).await?;
        Ok(Arc::new(TcpBlockConnection {
            block: block.clone(),
            timeout: self.timeout,
            stream: Mutex::new(Some(stream)),
        }))
    }

    async fn connect_chain(&self, block: &BlockId) -> ProtocolResult<ChainConnection> {
        let mut stream = connect(&addr(&block.host, block.chain_port), self.timeout).await?;
        match roundtrip(&mut stream, &Message::ChainOpen { block: block.id }).await? {
            Message::ChainOpened => {}
            other => return Err(unexpected("ChainOpened", &other)),
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, acks) = mpsc::channel(CHANNEL_CAPACITY);
        let target = block.to_string();
        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(Message::ChainAck { seq })) => {
                        if tx.send(seq).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        warn!(target = %target, message = other.type_name(), "unexpected message on chain link");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(target = %target, error = %e, "chain link closed");
                        break;
                    }
                }
            }
        });
        Ok(ChainConnection {
            link: Arc::new(TcpChainLink {
                writer: Mutex::new(writer),
            }),
            acks,
        })
    }
}

struct TcpChainLink {
    writer: Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl ChainLink for TcpChainLink {
    async fn chain_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &Message::ChainRequest { seq, op_id, args }).await
    }
}

/// Client connection to one block's service port.
///
/// Calls share one connection, reopened after a transport failure.
struct TcpBlockConnection {
    block: BlockId,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpBlockConnection {
    fn service_addr(&self) -> String {
        addr(&self.block.host, self.block.service_port)
    }

    async fn exchange(&self, request: Message) -> ProtocolResult<Message> {
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => connect(&self.service_addr(), self.timeout).await?,
        };
        let result = roundtrip(&mut stream, &request).await;
        match &result {
            Err(e) if e.is_transport() => {}
            _ => *guard = Some(stream),
        }
        result
    }

    /// Open a dedicated connection, send `request`, and wait for `ready`.
    async fn open_stream(&self, port: u16, request: Message, ready: &'static str) -> ProtocolResult<TcpStream> {
        let mut stream = connect(&addr(&self.block.host, port), self.timeout).await?;
        let reply = roundtrip(&mut stream, &request).await?;
        if reply.type_name() != ready {
            return Err(unexpected(ready, &reply));
        }
        Ok(stream)
    }
}

#[async_trait]
impl BlockConnection for TcpBlockConnection {
    async fn get_client_id(&self) -> ProtocolResult<i64> {
        match self.exchange(Message::GetClientId { block: self.block.id }).await? {
            Message::ClientId { client_id } => Ok(client_id),
            other => Err(unexpected("ClientId", &other)),
        }
    }

    async fn register_client_id(&self, client_id: i64) -> ProtocolResult<mpsc::Receiver<CommandResponse>> {
        let request = Message::RegisterClient {
            block: self.block.id,
            client_id,
        };
        let mut stream = self.open_stream(self.block.service_port, request, "Registered").await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Ok(Some(msg)) = read_message(&mut stream).await {
                match msg {
                    Message::CommandResponse(response) => {
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    other => {
                        warn!(client_id, message = other.type_name(), "unexpected message on response stream");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn command_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> ProtocolResult<()> {
        let request = Message::CommandRequest {
            block: self.block.id,
            seq,
            op_id,
            args,
        };
        match self.exchange(request).await? {
            Message::CommandResult { .. } => Ok(()),
            other => Err(unexpected("CommandResult", &other)),
        }
    }

    async fn run_command(&self, op_id: i32, args: Vec<String>) -> ProtocolResult<Vec<String>> {
        let request = Message::RunCommand {
            block: self.block.id,
            op_id,
            args,
        };
        match self.exchange(request).await? {
            Message::CommandResult { result } => Ok(result),
            other => Err(unexpected("CommandResult", &other)),
        }
    }

    async fn subscribe(&self, ops: Vec<String>) -> ProtocolResult<mpsc::Receiver<Notification>> {
        let request = Message::Subscribe {
            block: self.block.id,
            ops,
        };
        let mut stream = self.open_stream(self.block.notification_port, request, "Subscribed").await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Ok(Some(Message::Notification(n))) = read_message(&mut stream).await {
                if tx.send(n).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Management calls to storage nodes, one connection per call.
#[derive(Clone, Debug)]
pub struct RemoteStorageManager {
    timeout: Duration,
}

impl RemoteStorageManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn manage(&self, block: &BlockId, request: ManagementRequest) -> ProtocolResult<ManagementResponse> {
        let target = addr(&block.host, block.management_port);
        match call(&target, self.timeout, &Message::Management(request)).await? {
            Message::ManagementReply(reply) => Ok(reply),
            other => Err(unexpected("ManagementReply", &other)),
        }
    }

    async fn done(&self, block: &BlockId, request: ManagementRequest) -> ProtocolResult<()> {
        match self.manage(block, request).await? {
            ManagementResponse::Done => Ok(()),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Done",
                actual: "ManagementReply",
            }),
        }
    }

    async fn size(&self, block: &BlockId, request: ManagementRequest) -> ProtocolResult<u64> {
        match self.manage(block, request).await? {
            ManagementResponse::Size(n) => Ok(n),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Size",
                actual: "ManagementReply",
            }),
        }
    }
}

#[async_trait]
impl StorageManagement for RemoteStorageManager {
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
        let request = ManagementRequest::SetupBlock {
            block: block.id,
            path: path.to_string(),
            slot_range,
            chain: chain.to_vec(),
            auto_scale,
            role,
            next: next.cloned(),
        };
        self.done(block, request).await
    }

    async fn slot_range(&self, block: &BlockId) -> ProtocolResult<SlotRange> {
        match self.manage(block, ManagementRequest::SlotRange { block: block.id }).await? {
            ManagementResponse::SlotRange(range) => Ok(range),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "SlotRange",
                actual: "ManagementReply",
            }),
        }
    }

    async fn path(&self, block: &BlockId) -> ProtocolResult<String> {
        match self.manage(block, ManagementRequest::Path { block: block.id }).await? {
            ManagementResponse::Path(path) => Ok(path),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Path",
                actual: "ManagementReply",
            }),
        }
    }

    async fn load(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        let request = ManagementRequest::Load {
            block: block.id,
            backing_path: backing_path.to_string(),
        };
        self.done(block, request).await
    }

    async fn sync(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        let request = ManagementRequest::Sync {
            block: block.id,
            backing_path: backing_path.to_string(),
        };
        self.done(block, request).await
    }

    async fn dump(&self, block: &BlockId, backing_path: &str) -> ProtocolResult<()> {
        let request = ManagementRequest::Dump {
            block: block.id,
            backing_path: backing_path.to_string(),
        };
        self.done(block, request).await
    }

    async fn reset(&self, block: &BlockId) -> ProtocolResult<()> {
        self.done(block, ManagementRequest::Reset { block: block.id }).await
    }

    async fn set_exporting(&self, block: &BlockId, target: &[BlockId], slot_range: SlotRange) -> ProtocolResult<()> {
        let request = ManagementRequest::SetExporting {
            block: block.id,
            target: target.to_vec(),
            slot_range,
        };
        self.done(block, request).await
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
        let request = ManagementRequest::SetupAndSetImporting {
            block: block.id,
            path: path.to_string(),
            slot_range,
            chain: chain.to_vec(),
            role,
            next: next.cloned(),
        };
        self.done(block, request).await
    }

    async fn set_importing(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        let request = ManagementRequest::SetImporting {
            block: block.id,
            slot_range,
        };
        self.done(block, request).await
    }

    async fn export_slots(&self, block: &BlockId) -> ProtocolResult<()> {
        self.done(block, ManagementRequest::ExportSlots { block: block.id }).await
    }

    async fn set_regular(&self, block: &BlockId, slot_range: SlotRange) -> ProtocolResult<()> {
        let request = ManagementRequest::SetRegular {
            block: block.id,
            slot_range,
        };
        self.done(block, request).await
    }

    async fn storage_capacity(&self, block: &BlockId) -> ProtocolResult<u64> {
        self.size(block, ManagementRequest::StorageCapacity { block: block.id }).await
    }

    async fn storage_size(&self, block: &BlockId) -> ProtocolResult<u64> {
        self.size(block, ManagementRequest::StorageSize { block: block.id }).await
    }

    async fn resend_pending(&self, block: &BlockId) -> ProtocolResult<()> {
        self.done(block, ManagementRequest::ResendPending { block: block.id }).await
    }

    async fn forward_all(&self, block: &BlockId) -> ProtocolResult<()> {
        self.done(block, ManagementRequest::ForwardAll { block: block.id }).await
    }

    async fn ping(&self, block: &BlockId) -> ProtocolResult<()> {
        self.done(block, ManagementRequest::Ping).await
    }
}

/// Directory client over TCP, one connection per call.
#[derive(Clone, Debug)]
pub struct RemoteDirectory {
    addr: String,
    timeout: Duration,
}

impl RemoteDirectory {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&self, request: DirectoryRequest) -> ProtocolResult<DirectoryResponse> {
        match call(&self.addr, self.timeout, &Message::Directory(request)).await? {
            Message::DirectoryReply(reply) => Ok(reply),
            other => Err(unexpected("DirectoryReply", &other)),
        }
    }

    async fn done(&self, request: DirectoryRequest) -> ProtocolResult<()> {
        match self.request(request).await? {
            DirectoryResponse::Done => Ok(()),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Done",
                actual: "DirectoryReply",
            }),
        }
    }

    async fn status(&self, request: DirectoryRequest) -> ProtocolResult<DataStatus> {
        match self.request(request).await? {
            DirectoryResponse::Status(status) => Ok(status),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Status",
                actual: "DirectoryReply",
            }),
        }
    }

    async fn chain(&self, request: DirectoryRequest) -> ProtocolResult<ReplicaChain> {
        match self.request(request).await? {
            DirectoryResponse::Chain(chain) => Ok(chain),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Chain",
                actual: "DirectoryReply",
            }),
        }
    }
}

#[async_trait]
impl DirectoryService for RemoteDirectory {
    async fn create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus> {
        self.status(DirectoryRequest::Create {
            path: path.to_string(),
            backing_path: backing_path.to_string(),
            num_blocks,
            chain_length,
            flags,
        })
        .await
    }

    async fn open(&self, path: &str) -> ProtocolResult<DataStatus> {
        self.status(DirectoryRequest::Open { path: path.to_string() }).await
    }

    async fn open_or_create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus> {
        self.status(DirectoryRequest::OpenOrCreate {
            path: path.to_string(),
            backing_path: backing_path.to_string(),
            num_blocks,
            chain_length,
            flags,
        })
        .await
    }

    async fn exists(&self, path: &str) -> ProtocolResult<bool> {
        match self.request(DirectoryRequest::Exists { path: path.to_string() }).await? {
            DirectoryResponse::Exists(exists) => Ok(exists),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "Exists",
                actual: "DirectoryReply",
            }),
        }
    }

    async fn remove(&self, path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::Remove { path: path.to_string() }).await
    }

    async fn dstatus(&self, path: &str) -> ProtocolResult<DataStatus> {
        self.status(DirectoryRequest::Dstatus { path: path.to_string() }).await
    }

    async fn add_block_to_file(&self, path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::AddBlockToFile { path: path.to_string() }).await
    }

    async fn split_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()> {
        self.done(DirectoryRequest::SplitSlotRange {
            path: path.to_string(),
            slot_range,
        })
        .await
    }

    async fn merge_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()> {
        self.done(DirectoryRequest::MergeSlotRange {
            path: path.to_string(),
            slot_range,
        })
        .await
    }

    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
        self.chain(DirectoryRequest::ResolveFailures {
            path: path.to_string(),
            chain: chain.clone(),
        })
        .await
    }

    async fn add_replica_to_chain(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
        self.chain(DirectoryRequest::AddReplicaToChain {
            path: path.to_string(),
            chain: chain.clone(),
        })
        .await
    }

    async fn handle_lease_expiry(&self, path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::HandleLeaseExpiry { path: path.to_string() }).await
    }

    async fn dump(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::Dump {
            path: path.to_string(),
            backing_path: backing_path.to_string(),
        })
        .await
    }

    async fn load(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::Load {
            path: path.to_string(),
            backing_path: backing_path.to_string(),
        })
        .await
    }

    async fn sync(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        self.done(DirectoryRequest::Sync {
            path: path.to_string(),
            backing_path: backing_path.to_string(),
        })
        .await
    }
}
