//! Management calls applied to every block of a chain.

use tracing::debug;

use slotkv_protocol::StorageManagement;
use slotkv_types::{ReplicaChain, SlotRange};

use crate::error::DirectoryResult;

/// Assign each block its role and successor for `chain`.
pub(crate) async fn setup_chain(
    storage: &dyn StorageManagement,
    path: &str,
    chain: &ReplicaChain,
    slot_range: SlotRange,
    auto_scale: bool,
) -> DirectoryResult<()> {
    for (i, block) in chain.blocks.iter().enumerate() {
        let (role, next) = chain.wiring(i);
        debug!(%block, path, %role, next = ?next.map(ToString::to_string), "setting up block");
        storage
            .setup_block(block, path, slot_range, &chain.blocks, auto_scale, role, next)
            .await?;
    }
    Ok(())
}

/// Wire a fresh chain that owns nothing yet and accepts redirected traffic
/// for `import`.
pub(crate) async fn setup_importing_chain(
    storage: &dyn StorageManagement,
    path: &str,
    chain: &ReplicaChain,
    import: SlotRange,
) -> DirectoryResult<()> {
    for (i, block) in chain.blocks.iter().enumerate() {
        let (role, next) = chain.wiring(i);
        storage
            .setup_and_set_importing(block, path, import, &chain.blocks, role, next)
            .await?;
    }
    Ok(())
}

pub(crate) async fn set_exporting(
    storage: &dyn StorageManagement,
    chain: &ReplicaChain,
    target: &ReplicaChain,
    range: SlotRange,
) -> DirectoryResult<()> {
    for block in &chain.blocks {
        storage.set_exporting(block, &target.blocks, range).await?;
    }
    Ok(())
}

pub(crate) async fn set_importing(
    storage: &dyn StorageManagement,
    chain: &ReplicaChain,
    range: SlotRange,
) -> DirectoryResult<()> {
    for block in &chain.blocks {
        storage.set_importing(block, range).await?;
    }
    Ok(())
}

pub(crate) async fn set_regular(
    storage: &dyn StorageManagement,
    chain: &ReplicaChain,
    range: SlotRange,
) -> DirectoryResult<()> {
    for block in &chain.blocks {
        storage.set_regular(block, range).await?;
    }
    Ok(())
}

pub(crate) async fn reset(storage: &dyn StorageManagement, chain: &ReplicaChain) -> DirectoryResult<()> {
    for block in &chain.blocks {
        storage.reset(block).await?;
    }
    Ok(())
}
