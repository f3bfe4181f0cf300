//! Storage node for slotkv.
//!
//! A node hosts a fixed number of [`Block`]s. Each block serves one
//! [`Partition`] (the hash-table [`HashTablePartition`] is the one in use)
//! and takes one position in a replica chain:
//!
//! - Mutators enter at the head, are stamped with a chain sequence number,
//!   and flow head to tail. Every non-tail block keeps them in its pending
//!   table until the acknowledgment travels back.
//! - Accessors are served by the tail.
//! - During re-partitioning a block exports one slot sub-range to another
//!   chain in locked batches ([`Block::export_slots`]) and redirects clients
//!   to the target while it does.
//!
//! [`StorageNode`] exposes the blocks through the `StorageManagement` trait.
//! [`LocalNetwork`] wires nodes together in process for tests and embedding.

pub mod block;
pub mod chain;
pub mod error;
pub mod export;
pub mod kv;
pub mod local;
pub mod node;
pub mod partition;
pub mod pending;
pub mod persistence;
pub mod scaling;
pub mod subscription;

pub use block::Block;
pub use error::{StorageError, StorageResult};
pub use kv::{HashTablePartition, KvConfig};
pub use local::LocalNetwork;
pub use node::{NodeAddress, NodeContext, StorageNode};
pub use partition::{Partition, SlotView};
pub use pending::{PendingRequest, PendingTable};
pub use persistence::{FsSnapshotStore, InMemorySnapshotStore, SnapshotStore};
pub use subscription::SubscriptionMap;
