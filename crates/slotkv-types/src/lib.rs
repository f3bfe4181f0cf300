//! Foundation types for slotkv.
//!
//! This crate provides the identity, hash-slot, and replication metadata types
//! shared by every slotkv component. Every other slotkv crate depends on
//! `slotkv-types`.
//!
//! # Key Types
//!
//! - [`BlockId`]: Cross-process handle for one storage block
//! - [`SlotRange`]: Inclusive range over the `[0, SLOT_MAX]` hash space
//! - [`SequenceId`]: Client and chain sequence numbers for one request
//! - [`OpTable`]: Capability table mapping operations to accessor/mutator
//! - [`ReplicaChain`]: Directory-side view of one replicated partition
//! - [`DataStatus`]: Per-file ordered list of replica chains
//! - [`Reply`]: Typed view of the in-band reply codes

pub mod block;
pub mod chain;
pub mod error;
pub mod ops;
pub mod reply;
pub mod sequence;
pub mod slot;
pub mod status;

pub use block::{BlockId, BlockState, ChainRole};
pub use chain::{ChainStatus, ReplicaChain, StorageMode};
pub use error::TypeError;
pub use ops::{kv, kv_ops, OpInfo, OpKind, OpTable};
pub use reply::Reply;
pub use sequence::SequenceId;
pub use slot::{hash_slot, SlotRange, SLOT_MAX};
pub use status::{DataFlags, DataStatus};
