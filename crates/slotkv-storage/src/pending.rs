use std::collections::BTreeMap;
use std::sync::Mutex;

use slotkv_types::SequenceId;

/// A mutator forwarded downstream and not yet acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub seq: SequenceId,
    pub op_id: i32,
    pub args: Vec<String>,
}

/// Forwarded-but-unacknowledged mutators, keyed by server sequence number.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<BTreeMap<i64, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: PendingRequest) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(request.seq.server_seq_no, request);
    }

    /// Remove the entry for `server_seq_no`. Returns `true` if it was present.
    pub fn remove(&self, server_seq_no: i64) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .remove(&server_seq_no)
            .is_some()
    }

    pub fn contains(&self, server_seq_no: i64) -> bool {
        self.entries.lock().expect("lock poisoned").contains_key(&server_seq_no)
    }

    /// All entries in sequence order.
    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.entries.lock().expect("lock poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(server_seq_no: i64) -> PendingRequest {
        PendingRequest {
            seq: SequenceId {
                client_id: 1,
                client_seq_no: server_seq_no,
                server_seq_no,
            },
            op_id: 4,
            args: vec![format!("k{server_seq_no}")],
        }
    }

    #[test]
    fn snapshot_is_in_sequence_order() {
        let table = PendingTable::new();
        for n in [5, 1, 3] {
            table.insert(request(n));
        }
        let seqs: Vec<i64> = table.snapshot().iter().map(|r| r.seq.server_seq_no).collect();
        assert_eq!(seqs, vec![1, 3, 5]);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = PendingTable::new();
        table.insert(request(1));
        assert!(table.contains(1));
        assert!(table.remove(1));
        assert!(!table.remove(1));
        assert!(table.is_empty());
    }
}
