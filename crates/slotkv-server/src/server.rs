use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use slotkv_directory::{DirectoryTree, RandomBlockAllocator};
use slotkv_protocol::{ProtocolResult, Transport};
use slotkv_storage::{FsSnapshotStore, NodeContext, StorageNode};

use crate::config::{DirectoryConfig, StorageNodeConfig};
use crate::error::ServerResult;
use crate::handler;
use crate::remote::{RemoteDirectory, RemoteStorageManager, TcpTransport};

/// Accept connections on `listener` until `stop` flips, handing each one to
/// `handler` on its own task.
async fn accept_loop<F, Fut>(listener: TcpListener, port: &'static str, mut stop: watch::Receiver<bool>, handler: F)
where
    F: Fn(TcpStream) -> Fut,
    Fut: Future<Output = ProtocolResult<()>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(port, %addr, "listening");
    }
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!(port, "shutdown signal received; closing listener");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(inner) => inner,
                    Err(err) => {
                        error!(port, ?err, "failed to accept incoming connection");
                        continue;
                    }
                };
                if let Err(err) = socket.set_nodelay(true) {
                    debug!(port, ?peer, ?err, "set_nodelay failed");
                }
                let connection = handler(socket);
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        debug!(port, ?peer, error = %err, "connection terminated");
                    }
                });
            }
        }
    }
}

/// Listeners for the four storage node ports.
#[derive(Debug)]
pub struct StorageListeners {
    pub service: TcpListener,
    pub management: TcpListener,
    pub notification: TcpListener,
    pub chain: TcpListener,
}

impl StorageListeners {
    /// Bind the ports named in `config` on its host.
    pub async fn bind(config: &StorageNodeConfig) -> ServerResult<Self> {
        let bind = |port: u16| TcpListener::bind((config.host.clone(), port));
        Ok(Self {
            service: bind(config.service_port).await?,
            management: bind(config.management_port).await?,
            notification: bind(config.notification_port).await?,
            chain: bind(config.chain_port).await?,
        })
    }
}

/// A storage node process: the node and its TCP front end.
#[derive(Debug)]
pub struct StorageServer {
    config: StorageNodeConfig,
    node: Arc<StorageNode>,
}

impl StorageServer {
    pub fn new(config: StorageNodeConfig) -> ServerResult<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config.client.timeout));
        let snapshots = Arc::new(FsSnapshotStore::new(config.persistence_root.clone()));
        let ctx = Arc::new(NodeContext::new(
            transport,
            snapshots,
            config.kv.clone(),
            config.client.clone(),
        ));
        if let Some(addr) = &config.directory_addr {
            ctx.set_directory(Arc::new(RemoteDirectory::new(addr.clone(), config.client.timeout)));
        }
        let node = Arc::new(StorageNode::new(config.address(), config.num_blocks, ctx));
        Ok(Self { config, node })
    }

    pub fn config(&self) -> &StorageNodeConfig {
        &self.config
    }

    pub fn node(&self) -> &Arc<StorageNode> {
        &self.node
    }

    /// Bind the configured ports and serve until `shutdown` resolves.
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listeners = StorageListeners::bind(&self.config).await?;
        self.serve(listeners, shutdown).await
    }

    pub async fn serve<F>(&self, listeners: StorageListeners, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            node = %self.node.address().block_id(0).node_prefix(),
            num_blocks = self.config.num_blocks,
            "storage node serving"
        );
        let (stop_tx, stop) = watch::channel(false);
        let node = &self.node;
        let service = accept_loop(listeners.service, "service", stop.clone(), |s| {
            handler::serve_client(Arc::clone(node), s)
        });
        let management = accept_loop(listeners.management, "management", stop.clone(), |s| {
            handler::serve_management(Arc::clone(node), s)
        });
        let notification = accept_loop(listeners.notification, "notification", stop.clone(), |s| {
            handler::serve_notifications(Arc::clone(node), s)
        });
        let chain = accept_loop(listeners.chain, "chain", stop, |s| handler::serve_chain(Arc::clone(node), s));
        let stopper = async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        };
        tokio::join!(stopper, service, management, notification, chain);
        Ok(())
    }
}

/// The directory process.
#[derive(Debug)]
pub struct DirectoryServer {
    config: DirectoryConfig,
    tree: Arc<DirectoryTree>,
}

impl DirectoryServer {
    pub fn new(config: DirectoryConfig) -> ServerResult<Self> {
        config.validate()?;
        let storage = Arc::new(RemoteStorageManager::new(config.management_timeout()));
        let allocator = Arc::new(RandomBlockAllocator::with_blocks(&config.block_ids()));
        let tree = Arc::new(DirectoryTree::new(storage, allocator));
        info!(
            nodes = config.storage_nodes.len(),
            blocks = tree.allocator().num_free_blocks(),
            "directory created"
        );
        Ok(Self { config, tree })
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<DirectoryTree> {
        &self.tree
    }

    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop) = watch::channel(false);
        let tree = &self.tree;
        let directory = accept_loop(listener, "directory", stop, |s| {
            handler::serve_directory(Arc::clone(tree) as Arc<dyn slotkv_protocol::DirectoryService>, s)
        });
        let stopper = async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        };
        tokio::join!(stopper, directory);
        Ok(())
    }
}
