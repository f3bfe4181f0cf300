//! TCP front end for slotkv.
//!
//! Runs storage nodes and the directory as network services, and provides
//! the TCP implementations of the protocol's service traits that clients,
//! blocks, and the directory use to reach each other.
//!
//! A storage node listens on four ports: service (client calls and response
//! streams), management (directory calls), notification (subscriptions), and
//! chain (block-to-block forwarding). The directory listens on one.

pub mod config;
pub mod error;
pub mod handler;
pub mod remote;
pub mod server;

pub use config::{DirectoryConfig, StorageNodeConfig, StorageNodeEntry};
pub use error::{ServerError, ServerResult};
pub use remote::{RemoteDirectory, RemoteStorageManager, TcpTransport};
pub use server::{DirectoryServer, StorageListeners, StorageServer};
