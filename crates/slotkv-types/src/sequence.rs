use serde::{Deserialize, Serialize};

/// Sequence numbers attached to every chain request.
///
/// `client_id` is handed out by the chain head on first contact,
/// `client_seq_no` is the client's own counter, and `server_seq_no` is stamped
/// by the head and keys the pending table on every non-tail node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceId {
    pub client_id: i64,
    pub client_seq_no: i64,
    pub server_seq_no: i64,
}

impl SequenceId {
    pub fn new(client_id: i64, client_seq_no: i64) -> Self {
        Self {
            client_id,
            client_seq_no,
            server_seq_no: -1,
        }
    }

    /// Sequence used for internally generated traffic that no client waits on.
    pub fn internal() -> Self {
        Self {
            client_id: -1,
            client_seq_no: -1,
            server_seq_no: -1,
        }
    }

    /// Returns `true` if a client is waiting for the response to this request.
    pub fn has_client(&self) -> bool {
        self.client_id >= 0
    }
}
