//! Per-connection handlers for the storage node and directory ports.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use slotkv_protocol::error::codes;
use slotkv_protocol::{
    read_message, write_message, DirectoryRequest, DirectoryResponse, DirectoryService, ManagementRequest,
    ManagementResponse, Message, ProtocolError, ProtocolResult, StorageManagement, CHANNEL_CAPACITY,
};
use slotkv_storage::StorageNode;

/// The `Error` reply sent back for a failed call.
pub fn error_message(e: &ProtocolError) -> Message {
    match e {
        ProtocolError::RemoteError { code, message } => Message::Error {
            code: *code,
            message: message.clone(),
        },
        ProtocolError::BlockNotFound(_) => Message::Error {
            code: codes::NOT_FOUND,
            message: e.to_string(),
        },
        other => Message::Error {
            code: codes::INTERNAL,
            message: other.to_string(),
        },
    }
}

async fn reply<W>(writer: &mut W, result: ProtocolResult<Message>) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    match result {
        Ok(msg) => write_message(writer, &msg).await,
        Err(e) => write_message(writer, &error_message(&e)).await,
    }
}

fn unexpected(msg: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected: "request",
        actual: msg.type_name(),
    }
}

/// Push everything from `rx` onto `writer` until either side goes away.
async fn push<W, T>(writer: &mut W, mut rx: mpsc::Receiver<T>, wrap: fn(T) -> Message) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        write_message(writer, &wrap(item)).await?;
    }
    Ok(())
}

/// Serve the client-facing service port.
///
/// A `RegisterClient` turns the connection into that client's response
/// stream for the rest of its life.
pub async fn serve_client(node: Arc<StorageNode>, mut stream: TcpStream) -> ProtocolResult<()> {
    while let Some(msg) = read_message(&mut stream).await? {
        let result = match msg {
            Message::GetClientId { block } => node
                .block(block)
                .map(|b| Message::ClientId {
                    client_id: b.get_client_id(),
                })
                .map_err(ProtocolError::from),
            Message::CommandRequest {
                block,
                seq,
                op_id,
                args,
            } => match node.block(block) {
                Ok(b) => b
                    .request(seq, op_id, args)
                    .await
                    .map(|_| Message::CommandResult { result: Vec::new() })
                    .map_err(ProtocolError::from),
                Err(e) => Err(e.into()),
            },
            Message::RunCommand { block, op_id, args } => match node.block(block) {
                Ok(b) => b
                    .run_command(op_id, args)
                    .await
                    .map(|result| Message::CommandResult { result })
                    .map_err(ProtocolError::from),
                Err(e) => Err(e.into()),
            },
            Message::RegisterClient { block, client_id } => {
                let rx = match node.block(block) {
                    Ok(b) => b.register_client_id(client_id),
                    Err(e) => {
                        reply(&mut stream, Err(e.into())).await?;
                        continue;
                    }
                };
                write_message(&mut stream, &Message::Registered).await?;
                debug!(block, client_id, "response stream opened");
                return push(&mut stream, rx, Message::CommandResponse).await;
            }
            other => Err(unexpected(&other)),
        };
        reply(&mut stream, result).await?;
    }
    Ok(())
}

/// Serve the notification port: one `Subscribe`, then a push stream.
pub async fn serve_notifications(node: Arc<StorageNode>, mut stream: TcpStream) -> ProtocolResult<()> {
    let Some(msg) = read_message(&mut stream).await? else {
        return Ok(());
    };
    match msg {
        Message::Subscribe { block, ops } => {
            let rx = match node.block(block) {
                Ok(b) => b.subscribe(ops),
                Err(e) => return reply(&mut stream, Err(e.into())).await,
            };
            write_message(&mut stream, &Message::Subscribed).await?;
            push(&mut stream, rx, Message::Notification).await
        }
        other => reply(&mut stream, Err(unexpected(&other))).await,
    }
}

/// Serve the chain port: `ChainOpen` names the block this link feeds, after
/// which requests flow in and acknowledgments flow back out.
pub async fn serve_chain(node: Arc<StorageNode>, mut stream: TcpStream) -> ProtocolResult<()> {
    let Some(msg) = read_message(&mut stream).await? else {
        return Ok(());
    };
    let block = match msg {
        Message::ChainOpen { block } => match node.block(block) {
            Ok(b) => Arc::clone(b),
            Err(e) => return reply(&mut stream, Err(e.into())).await,
        },
        other => return reply(&mut stream, Err(unexpected(&other))).await,
    };
    write_message(&mut stream, &Message::ChainOpened).await?;

    let (mut reader, mut writer) = stream.into_split();
    let (tx, acks) = mpsc::channel(CHANNEL_CAPACITY);
    block.attach_prev(tx);
    let acker = tokio::spawn(async move { push(&mut writer, acks, |seq| Message::ChainAck { seq }).await });

    let result = loop {
        match read_message(&mut reader).await {
            Ok(Some(Message::ChainRequest { seq, op_id, args })) => {
                if let Err(e) = block.chain_request(seq, op_id, args).await {
                    warn!(block = %block.id(), ?seq, error = %e, "chain request failed");
                }
            }
            Ok(Some(other)) => break Err(unexpected(&other)),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    acker.abort();
    result
}

/// Serve the management port, one reply per request.
pub async fn serve_management(node: Arc<StorageNode>, stream: TcpStream) -> ProtocolResult<()> {
    serve_requests(stream, |msg| {
        let node = Arc::clone(&node);
        async move {
            match msg {
                Message::Management(request) => handle_management(&node, request).await.map(Message::ManagementReply),
                other => Err(unexpected(&other)),
            }
        }
    })
    .await
}

/// Serve the directory port, one reply per request.
pub async fn serve_directory(directory: Arc<dyn DirectoryService>, stream: TcpStream) -> ProtocolResult<()> {
    serve_requests(stream, |msg| {
        let directory = Arc::clone(&directory);
        async move {
            match msg {
                Message::Directory(request) => handle_directory(directory.as_ref(), request)
                    .await
                    .map(Message::DirectoryReply),
                other => Err(unexpected(&other)),
            }
        }
    })
    .await
}

async fn serve_requests<S, F, Fut>(mut stream: S, handle: F) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(Message) -> Fut,
    Fut: std::future::Future<Output = ProtocolResult<Message>>,
{
    while let Some(msg) = read_message(&mut stream).await? {
        let result = handle(msg).await;
        reply(&mut stream, result).await?;
    }
    Ok(())
}

/// Apply one management call to `node`.
pub async fn handle_management(node: &StorageNode, request: ManagementRequest) -> ProtocolResult<ManagementResponse> {
    use ManagementRequest as R;
    use ManagementResponse::Done;

    let id = |block: u32| node.address().block_id(block);
    let response = match request {
        R::SetupBlock {
            block,
            path,
            slot_range,
            chain,
            auto_scale,
            role,
            next,
        } => {
            node.setup_block(&id(block), &path, slot_range, &chain, auto_scale, role, next.as_ref())
                .await?;
            Done
        }
        R::SlotRange { block } => ManagementResponse::SlotRange(node.slot_range(&id(block)).await?),
        R::Path { block } => ManagementResponse::Path(node.path(&id(block)).await?),
        R::Load { block, backing_path } => {
            node.load(&id(block), &backing_path).await?;
            Done
        }
        R::Sync { block, backing_path } => {
            node.sync(&id(block), &backing_path).await?;
            Done
        }
        R::Dump { block, backing_path } => {
            node.dump(&id(block), &backing_path).await?;
            Done
        }
        R::Reset { block } => {
            node.reset(&id(block)).await?;
            Done
        }
        R::SetExporting {
            block,
            target,
            slot_range,
        } => {
            node.set_exporting(&id(block), &target, slot_range).await?;
            Done
        }
        R::SetupAndSetImporting {
            block,
            path,
            slot_range,
            chain,
            role,
            next,
        } => {
            node.setup_and_set_importing(&id(block), &path, slot_range, &chain, role, next.as_ref())
                .await?;
            Done
        }
        R::SetImporting { block, slot_range } => {
            node.set_importing(&id(block), slot_range).await?;
            Done
        }
        R::ExportSlots { block } => {
            node.export_slots(&id(block)).await?;
            Done
        }
        R::SetRegular { block, slot_range } => {
            node.set_regular(&id(block), slot_range).await?;
            Done
        }
        R::StorageCapacity { block } => ManagementResponse::Size(node.storage_capacity(&id(block)).await?),
        R::StorageSize { block } => ManagementResponse::Size(node.storage_size(&id(block)).await?),
        R::ResendPending { block } => {
            node.resend_pending(&id(block)).await?;
            Done
        }
        R::ForwardAll { block } => {
            node.forward_all(&id(block)).await?;
            Done
        }
        R::Ping => Done,
    };
    Ok(response)
}

/// Apply one directory call.
pub async fn handle_directory(
    directory: &dyn DirectoryService,
    request: DirectoryRequest,
) -> ProtocolResult<DirectoryResponse> {
    use DirectoryRequest as R;
    use DirectoryResponse::{Chain, Done, Status};

    let response = match request {
        R::Create {
            path,
            backing_path,
            num_blocks,
            chain_length,
            flags,
        } => Status(directory.create(&path, &backing_path, num_blocks, chain_length, flags).await?),
        R::Open { path } => Status(directory.open(&path).await?),
        R::OpenOrCreate {
            path,
            backing_path,
            num_blocks,
            chain_length,
            flags,
        } => Status(
            directory
                .open_or_create(&path, &backing_path, num_blocks, chain_length, flags)
                .await?,
        ),
        R::Exists { path } => DirectoryResponse::Exists(directory.exists(&path).await?),
        R::Remove { path } => {
            directory.remove(&path).await?;
            Done
        }
        R::Dstatus { path } => Status(directory.dstatus(&path).await?),
        R::AddBlockToFile { path } => {
            directory.add_block_to_file(&path).await?;
            Done
        }
        R::SplitSlotRange { path, slot_range } => {
            directory.split_slot_range(&path, slot_range).await?;
            Done
        }
        R::MergeSlotRange { path, slot_range } => {
            directory.merge_slot_range(&path, slot_range).await?;
            Done
        }
        R::ResolveFailures { path, chain } => Chain(directory.resolve_failures(&path, &chain).await?),
        R::AddReplicaToChain { path, chain } => Chain(directory.add_replica_to_chain(&path, &chain).await?),
        R::HandleLeaseExpiry { path } => {
            directory.handle_lease_expiry(&path).await?;
            Done
        }
        R::Dump { path, backing_path } => {
            directory.dump(&path, &backing_path).await?;
            Done
        }
        R::Load { path, backing_path } => {
            directory.load(&path, &backing_path).await?;
            Done
        }
        R::Sync { path, backing_path } => {
            directory.sync(&path, &backing_path).await?;
            Done
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    use slotkv_client::ClientConfig;
    use slotkv_storage::{InMemorySnapshotStore, KvConfig, LocalNetwork};
    use slotkv_types::{ChainRole, SlotRange};

    #[test]
    fn errors_keep_remote_codes() {
        let remote = ProtocolError::RemoteError {
            code: codes::DIRECTORY,
            message: "no such file".into(),
        };
        match error_message(&remote) {
            Message::Error { code, message } => {
                assert_eq!(code, codes::DIRECTORY);
                assert_eq!(message, "no such file");
            }
            other => panic!("unexpected {other:?}"),
        }
        match error_message(&ProtocolError::BlockNotFound("7".into())) {
            Message::Error { code, .. } => assert_eq!(code, codes::NOT_FOUND),
            other => panic!("unexpected {other:?}"),
        }
        match error_message(&ProtocolError::ConnectionClosed) {
            Message::Error { code, .. } => assert_eq!(code, codes::INTERNAL),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn management_calls_reach_the_block() {
        let net = LocalNetwork::new(Arc::new(InMemorySnapshotStore::new()), ClientConfig::default());
        let node = net.add_node(2, KvConfig::default());
        let block = node.address().block_id(1);

        let setup = ManagementRequest::SetupBlock {
            block: 1,
            path: "/f".into(),
            slot_range: SlotRange::full(),
            chain: vec![block.clone()],
            auto_scale: false,
            role: ChainRole::Singleton,
            next: None,
        };
        assert_eq!(handle_management(&node, setup).await.unwrap(), ManagementResponse::Done);
        assert_eq!(
            handle_management(&node, ManagementRequest::SlotRange { block: 1 }).await.unwrap(),
            ManagementResponse::SlotRange(SlotRange::full())
        );
        assert_eq!(
            handle_management(&node, ManagementRequest::Path { block: 1 }).await.unwrap(),
            ManagementResponse::Path("/f".into())
        );
        assert_eq!(handle_management(&node, ManagementRequest::Ping).await.unwrap(), ManagementResponse::Done);
        assert!(handle_management(&node, ManagementRequest::Reset { block: 9 }).await.is_err());
    }
}
