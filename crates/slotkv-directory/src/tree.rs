//! The directory: file table plus the [`DirectoryService`] surface.
//!
//! Each file's layout sits behind its own async read-write lock. Lookups take
//! it shared; layout changes take it exclusively, and only for their setup
//! and commit steps, never across a data migration.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use slotkv_protocol::{DirectoryService, ProtocolResult, StorageManagement};
use slotkv_types::{DataStatus, ReplicaChain, SlotRange};

use crate::allocator::BlockAllocator;
use crate::error::{DirectoryError, DirectoryResult};
use crate::names::validate_path;
use crate::policy::{DefaultPolicy, RepartitionPolicy};

/// Mutable state of one file.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub status: DataStatus,
    /// Chains allocated by an in-flight split, not yet in `status`.
    pub adding: Vec<ReplicaChain>,
}

pub(crate) type FileNode = tokio::sync::RwLock<FileState>;

/// Maps file paths to replica-chain layouts and drives re-partitioning.
pub struct DirectoryTree {
    files: RwLock<BTreeMap<String, Arc<FileNode>>>,
    pub(crate) storage: Arc<dyn StorageManagement>,
    pub(crate) allocator: Arc<dyn BlockAllocator>,
    pub(crate) policy: Arc<dyn RepartitionPolicy>,
}

impl DirectoryTree {
    pub fn new(storage: Arc<dyn StorageManagement>, allocator: Arc<dyn BlockAllocator>) -> Self {
        Self::with_policy(storage, allocator, Arc::new(DefaultPolicy))
    }

    pub fn with_policy(
        storage: Arc<dyn StorageManagement>,
        allocator: Arc<dyn BlockAllocator>,
        policy: Arc<dyn RepartitionPolicy>,
    ) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            storage,
            allocator,
            policy,
        }
    }

    pub fn allocator(&self) -> &Arc<dyn BlockAllocator> {
        &self.allocator
    }

    /// All file paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.read().expect("lock poisoned").keys().cloned().collect()
    }

    /// Number of chains `path` currently has, counting chains being added.
    pub async fn num_chains(&self, path: &str) -> DirectoryResult<usize> {
        let node = self.file(path)?;
        let state = node.read().await;
        Ok(state.status.chains.len() + state.adding.len())
    }

    pub(crate) fn file(&self, path: &str) -> DirectoryResult<Arc<FileNode>> {
        self.files
            .read()
            .expect("lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound { path: path.to_string() })
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.files.read().expect("lock poisoned").contains_key(path)
    }

    /// Insert a new file. Fails if the path was taken in the meantime.
    pub(crate) fn insert(&self, path: &str, status: DataStatus) -> DirectoryResult<()> {
        let mut files = self.files.write().expect("lock poisoned");
        if files.contains_key(path) {
            return Err(DirectoryError::AlreadyExists { path: path.to_string() });
        }
        files.insert(
            path.to_string(),
            Arc::new(tokio::sync::RwLock::new(FileState {
                status,
                adding: Vec::new(),
            })),
        );
        Ok(())
    }

    pub(crate) fn detach(&self, path: &str) -> DirectoryResult<Arc<FileNode>> {
        self.files
            .write()
            .expect("lock poisoned")
            .remove(path)
            .ok_or_else(|| DirectoryError::NotFound { path: path.to_string() })
    }

    pub async fn open(&self, path: &str) -> DirectoryResult<DataStatus> {
        let node = self.file(path)?;
        let state = node.read().await;
        Ok(state.status.clone())
    }

    pub fn exists(&self, path: &str) -> DirectoryResult<bool> {
        validate_path(path)?;
        Ok(self.contains(path))
    }

    pub async fn open_or_create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> DirectoryResult<DataStatus> {
        match self.open(path).await {
            Err(DirectoryError::NotFound { .. }) => {
                match self.create(path, backing_path, num_blocks, chain_length, flags).await {
                    // Lost a race with another creator.
                    Err(DirectoryError::AlreadyExists { .. }) => self.open(path).await,
                    other => other,
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for DirectoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryTree")
            .field("files", &self.paths())
            .field("free_blocks", &self.allocator.num_free_blocks())
            .finish()
    }
}

#[async_trait]
impl DirectoryService for DirectoryTree {
    async fn create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus> {
        Ok(DirectoryTree::create(self, path, backing_path, num_blocks, chain_length, flags).await?)
    }

    async fn open(&self, path: &str) -> ProtocolResult<DataStatus> {
        Ok(DirectoryTree::open(self, path).await?)
    }

    async fn open_or_create(
        &self,
        path: &str,
        backing_path: &str,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    ) -> ProtocolResult<DataStatus> {
        Ok(DirectoryTree::open_or_create(self, path, backing_path, num_blocks, chain_length, flags).await?)
    }

    async fn exists(&self, path: &str) -> ProtocolResult<bool> {
        Ok(DirectoryTree::exists(self, path)?)
    }

    async fn remove(&self, path: &str) -> ProtocolResult<()> {
        Ok(DirectoryTree::remove(self, path).await?)
    }

    async fn dstatus(&self, path: &str) -> ProtocolResult<DataStatus> {
        Ok(DirectoryTree::open(self, path).await?)
    }

    async fn add_block_to_file(&self, path: &str) -> ProtocolResult<()> {
        info!(path, "adding block to file");
        Ok(DirectoryTree::add_block_to_file(self, path).await?)
    }

    async fn split_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()> {
        Ok(DirectoryTree::split_slot_range(self, path, slot_range).await?)
    }

    async fn merge_slot_range(&self, path: &str, slot_range: SlotRange) -> ProtocolResult<()> {
        Ok(DirectoryTree::merge_slot_range(self, path, slot_range).await?)
    }

    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
        Ok(DirectoryTree::resolve_failures(self, path, chain).await?)
    }

    async fn add_replica_to_chain(&self, path: &str, chain: &ReplicaChain) -> ProtocolResult<ReplicaChain> {
        Ok(DirectoryTree::add_replica_to_chain(self, path, chain).await?)
    }

    async fn handle_lease_expiry(&self, path: &str) -> ProtocolResult<()> {
        Ok(DirectoryTree::handle_lease_expiry(self, path).await?)
    }

    async fn dump(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        Ok(DirectoryTree::dump(self, path, backing_path).await?)
    }

    async fn load(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        Ok(DirectoryTree::load(self, path, backing_path).await?)
    }

    async fn sync(&self, path: &str, backing_path: &str) -> ProtocolResult<()> {
        Ok(DirectoryTree::sync(self, path, backing_path).await?)
    }
}
