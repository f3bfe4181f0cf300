use slotkv_types::{reply, BlockId, BlockState, OpTable, SlotRange};

use crate::error::StorageResult;

/// Slot ownership of a block at the moment a command runs.
///
/// Owned by the block and swapped whole on every management call, so a
/// command always sees one consistent combination of ranges and state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotView {
    pub slot_range: SlotRange,
    pub import_range: SlotRange,
    pub export_range: SlotRange,
    pub state: BlockState,
    pub export_target: Vec<BlockId>,
}

impl SlotView {
    pub fn new(slot_range: SlotRange) -> Self {
        Self {
            slot_range,
            ..Self::default()
        }
    }

    /// Returns `true` if this block may serve `slot`. Imported slots are only
    /// served to redirected traffic.
    pub fn serves(&self, slot: i32, redirected: bool) -> bool {
        self.slot_range.contains(slot) || (redirected && self.import_range.contains(slot))
    }

    /// The exporting redirect for `slot`, if it is being moved away.
    pub fn export_redirect(&self, slot: i32) -> Option<String> {
        if self.state == BlockState::Exporting && self.export_range.contains(slot) {
            Some(reply::exporting(&self.export_target))
        } else {
            None
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.state != BlockState::Regular
    }
}

/// One partition type served by the chain machinery.
///
/// The chain and migration logic in this crate is written against this trait
/// only. Implementations use interior locking; the chain serializes mutators
/// before they reach `run_command`.
pub trait Partition: Send + Sync {
    /// Capability table handed to the partition at construction.
    fn ops(&self) -> &OpTable;

    /// Execute one operation. Per-key results are returned in argument order.
    fn run_command(&self, view: &SlotView, op_id: i32, args: &[String]) -> StorageResult<Vec<String>>;

    /// Keys a mutator touched, announced to subscribers by the tail.
    fn affected_keys(&self, op_id: i32, args: &[String]) -> Vec<String>;

    /// Operations allowed to run while the partition is locked.
    fn bypasses_lock(&self, op_id: i32) -> bool;

    /// Operations whose success can leave the partition underloaded.
    fn shrinks(&self, op_id: i32) -> bool;

    fn is_locked(&self) -> bool;

    fn storage_size(&self) -> u64;

    fn storage_capacity(&self) -> u64;

    fn overloaded(&self) -> bool;

    fn underloaded(&self) -> bool;

    /// Drop all data and release the lock.
    fn clear(&self);

    /// Serialize the partition contents.
    fn snapshot(&self) -> StorageResult<Vec<u8>>;

    /// Replace the partition contents with a snapshot.
    fn restore(&self, bytes: &[u8]) -> StorageResult<()>;

    /// Commands that rebuild the current contents on an empty replica.
    fn replay_commands(&self) -> Vec<(i32, Vec<String>)>;
}
