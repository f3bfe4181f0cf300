//! Client library for slotkv.
//!
//! [`ReplicaChainClient`] talks to one replica chain: mutators go to the head,
//! accessors to the tail, and responses are matched by sequence number.
//! [`LockedClient`] holds a chain's explicit lock for multi-key work.
//! [`KvClient`] routes keys to chains by hash slot and follows the
//! exporting/moved redirect protocol.

pub mod chain_client;
pub mod config;
pub mod error;
pub mod kv_client;
pub mod locked;

pub use chain_client::ReplicaChainClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use kv_client::KvClient;
pub use locked::LockedClient;

// Re-export key types
pub use slotkv_types::{BlockId, DataStatus, ReplicaChain, Reply, SlotRange};
