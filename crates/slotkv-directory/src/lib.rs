//! Directory coordinator for slotkv.
//!
//! The directory owns the namespace of files. Each file is a set of replica
//! chains that together tile the slot space `[0, SLOT_MAX]`. The directory
//! allocates blocks to chains, wires them into head/mid/tail order, and
//! drives every change to a file's layout:
//!
//! - **Re-partitioning** splits a chain's range in two or merges a chain into
//!   its neighbour while the data stays online.
//! - **Repair** drops failed replicas from a chain or attaches new ones.
//! - **Lifecycle** moves a file between memory and its backing path, and
//!   applies the lease-expiry policy its flags select.
//!
//! # Modules
//!
//! - [`error`]: error types for directory operations
//! - [`tree`]: [`DirectoryTree`], the file table and service surface
//! - [`allocator`]: the [`BlockAllocator`] trait and [`RandomBlockAllocator`]
//! - [`policy`]: which chain to split or merge, via [`RepartitionPolicy`]
//! - [`names`]: path validation

pub mod allocator;
pub mod error;
mod lifecycle;
mod migration;
pub mod names;
pub mod policy;
mod repair;
pub mod tree;
mod wiring;

#[cfg(test)]
mod scenarios;

pub use allocator::{BlockAllocator, RandomBlockAllocator};
pub use error::{DirectoryError, DirectoryResult};
pub use names::validate_path;
pub use policy::{DefaultPolicy, RepartitionPolicy};
pub use tree::DirectoryTree;
