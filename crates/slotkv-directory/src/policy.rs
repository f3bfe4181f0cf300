//! Re-partitioning policy: which chain to split when a block is added, and
//! which neighbour absorbs a chain that is merged away.

use slotkv_types::DataStatus;

pub trait RepartitionPolicy: Send + Sync {
    /// Index of the chain to split for `add_block_to_file`, given each chain's
    /// tail storage size. `None` if no chain can be split.
    fn split_candidate(&self, status: &DataStatus, sizes: &[u64]) -> Option<usize>;

    /// Index of the chain that absorbs chain `index` on merge.
    fn merge_partner(&self, status: &DataStatus, index: usize) -> Option<usize>;
}

/// Split the largest chain that is stable and owns more than one slot; merge
/// into the immediate right neighbour.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl RepartitionPolicy for DefaultPolicy {
    fn split_candidate(&self, status: &DataStatus, sizes: &[u64]) -> Option<usize> {
        status
            .chains
            .iter()
            .zip(sizes)
            .enumerate()
            .filter(|(_, (chain, _))| !chain.is_migrating() && chain.slot_range.len() > 1)
            // First of equals wins.
            .fold(None, |best: Option<(usize, u64)>, (i, (_, &size))| match best {
                Some((_, s)) if s >= size => best,
                _ => Some((i, size)),
            })
            .map(|(i, _)| i)
    }

    fn merge_partner(&self, status: &DataStatus, index: usize) -> Option<usize> {
        let partner = index + 1;
        (partner < status.chains.len()).then_some(partner)
    }
}
