//! Chain replication.
//!
//! Mutators enter at the head, which stamps a chain sequence number, applies
//! them locally, records them as pending, and forwards them downstream. Every
//! hop applies and forwards in arrival order; the tail answers the client and
//! sends an acknowledgment back up the chain, which unwinds the pending
//! tables hop by hop. Accessors are served by the tail alone.
//!
//! A block only ever holds a handle to its successor. Acknowledgments travel
//! over a channel the successor registered when the link was opened.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use slotkv_protocol::{ChainConnection, ChainLink};
use slotkv_types::{BlockId, ChainRole, SequenceId};

use crate::block::Block;
use crate::error::{StorageError, StorageResult};
use crate::pending::PendingRequest;

/// Role, downstream link, and upstream ack sink of one block.
pub(crate) struct ChainLinks {
    role: RwLock<ChainRole>,
    next: RwLock<Option<Arc<dyn ChainLink>>>,
    prev: Mutex<Option<mpsc::Sender<SequenceId>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Serializes sequence assignment and forwarding; holds the next
    /// `server_seq_no` to hand out.
    pub(crate) request_lock: tokio::sync::Mutex<i64>,
}

impl ChainLinks {
    pub(crate) fn new() -> Self {
        Self {
            role: RwLock::new(ChainRole::Singleton),
            next: RwLock::new(None),
            prev: Mutex::new(None),
            listener: Mutex::new(None),
            request_lock: tokio::sync::Mutex::new(0),
        }
    }

    pub(crate) fn role(&self) -> ChainRole {
        *self.role.read().expect("lock poisoned")
    }

    pub(crate) fn set_role(&self, role: ChainRole) {
        *self.role.write().expect("lock poisoned") = role;
    }

    pub(crate) fn next(&self) -> Option<Arc<dyn ChainLink>> {
        self.next.read().expect("lock poisoned").clone()
    }

    fn set_next(&self, link: Option<Arc<dyn ChainLink>>) {
        *self.next.write().expect("lock poisoned") = link;
    }

    fn prev(&self) -> Option<mpsc::Sender<SequenceId>> {
        self.prev.lock().expect("lock poisoned").clone()
    }

    fn set_prev(&self, sink: Option<mpsc::Sender<SequenceId>>) {
        *self.prev.lock().expect("lock poisoned") = sink;
    }

    fn replace_listener(&self, handle: Option<JoinHandle<()>>) {
        let old = std::mem::replace(&mut *self.listener.lock().expect("lock poisoned"), handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    pub(crate) async fn reset(&self) {
        let mut seq = self.request_lock.lock().await;
        *seq = 0;
        self.replace_listener(None);
        self.set_next(None);
        self.set_prev(None);
        self.set_role(ChainRole::Singleton);
    }
}

impl Block {
    /// Client-facing entry point.
    ///
    /// Mutators are accepted at the head and accessors at the tail; anything
    /// else is a protocol violation and is refused.
    pub async fn request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> StorageResult<()> {
        let ops = self.partition.ops();
        if ops.get(op_id).is_none() {
            return Err(StorageError::UnknownOp(op_id));
        }
        let role = self.role();
        let mutator = ops.is_mutator(op_id);
        if (mutator && !role.is_head()) || (!mutator && !role.is_tail()) {
            error!(block = %self.id, %role, op_id, client_id = seq.client_id, "client request at wrong chain position");
            return Err(self.violation(format!("{} request at {role}", if mutator { "mutator" } else { "accessor" })));
        }

        if !mutator {
            let result = self.run_command(op_id, args).await?;
            self.respond(seq, result).await;
            return Ok(());
        }

        let bypass = self.partition.bypasses_lock(op_id);
        loop {
            if !bypass {
                self.wait_unlocked().await;
            }
            let mut chain_seq = self.links.request_lock.lock().await;
            if !bypass && self.partition.is_locked() {
                continue;
            }
            let result = self.apply(op_id, &args)?;
            if role.is_tail() {
                drop(chain_seq);
                self.complete(seq, op_id, &args, result).await;
                return Ok(());
            }
            let mut seq = seq;
            seq.server_seq_no = *chain_seq;
            *chain_seq += 1;
            trace!(block = %self.id, server_seq_no = seq.server_seq_no, op_id, "forwarding");
            self.pending.insert(PendingRequest {
                seq,
                op_id,
                args: args.clone(),
            });
            return self.forward(seq, op_id, args).await;
        }
    }

    /// Entry point for a request arriving from the predecessor.
    pub async fn chain_request(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> StorageResult<()> {
        let role = self.role();
        if role.is_head() {
            error!(block = %self.id, %role, server_seq_no = seq.server_seq_no, "chain request at head");
            return Err(self.violation(format!("chain request at {role}")));
        }
        let guard = self.links.request_lock.lock().await;
        let result = self.apply(op_id, &args)?;
        if role.is_tail() {
            drop(guard);
            self.complete(seq, op_id, &args, result).await;
            // Internal traffic (replica catch-up) carries no sequence to acknowledge.
            if seq.server_seq_no >= 0 {
                self.send_ack(seq).await;
            }
            return Ok(());
        }
        self.pending.insert(PendingRequest {
            seq,
            op_id,
            args: args.clone(),
        });
        let forwarded = self.forward(seq, op_id, args).await;
        drop(guard);
        forwarded
    }

    /// Downstream acknowledgment of `seq`.
    pub async fn ack(&self, seq: SequenceId) {
        if !self.pending.remove(seq.server_seq_no) {
            trace!(block = %self.id, server_seq_no = seq.server_seq_no, "ack for unknown sequence");
        }
        if !self.role().is_head() {
            self.send_ack(seq).await;
        }
    }

    /// Register the channel acknowledgments to the predecessor go to.
    pub fn attach_prev(&self, sink: mpsc::Sender<SequenceId>) {
        self.links.set_prev(Some(sink));
    }

    /// Replay every unacknowledged mutator to the current successor.
    pub async fn resend_pending(&self) -> StorageResult<()> {
        let _guard = self.links.request_lock.lock().await;
        let next = self.next_link()?;
        let pending = self.pending.snapshot();
        debug!(block = %self.id, count = pending.len(), "resending pending requests");
        for req in pending {
            next.chain_request(req.seq, req.op_id, req.args).await?;
        }
        Ok(())
    }

    /// Stream the full partition contents to the successor.
    pub async fn forward_all(&self) -> StorageResult<()> {
        let _guard = self.links.request_lock.lock().await;
        let next = self.next_link()?;
        let commands = self.partition.replay_commands();
        debug!(block = %self.id, batches = commands.len(), "forwarding all data");
        for (op_id, args) in commands {
            next.chain_request(SequenceId::internal(), op_id, args).await?;
        }
        Ok(())
    }

    /// Point the downstream link at `next` without listening for acknowledgments.
    pub async fn reset_next(&self, next: Option<&BlockId>) -> StorageResult<Option<ChainConnection>> {
        self.links.replace_listener(None);
        match next {
            None => {
                self.links.set_next(None);
                Ok(None)
            }
            Some(id) => {
                let conn = self.ctx.transport.connect_chain(id).await?;
                self.links.set_next(Some(Arc::clone(&conn.link)));
                Ok(Some(conn))
            }
        }
    }

    /// Point the downstream link at `next` and turn its acknowledgments into
    /// [`Block::ack`] calls.
    ///
    /// A tail can carry a link too while a new replica is being attached; its
    /// listener simply sees no traffic.
    pub async fn reset_next_and_listen(&self, next: Option<&BlockId>) -> StorageResult<()> {
        let Some(conn) = self.reset_next(next).await? else {
            return Ok(());
        };
        let mut acks = conn.acks;
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(seq) = acks.recv().await {
                let Some(block) = weak.upgrade() else { break };
                block.ack(seq).await;
            }
        });
        self.links.replace_listener(Some(handle));
        Ok(())
    }

    async fn forward(&self, seq: SequenceId, op_id: i32, args: Vec<String>) -> StorageResult<()> {
        let next = self.next_link()?;
        next.chain_request(seq, op_id, args).await?;
        Ok(())
    }

    async fn send_ack(&self, seq: SequenceId) {
        match self.links.prev() {
            Some(sink) => {
                if sink.send(seq).await.is_err() {
                    warn!(block = %self.id, server_seq_no = seq.server_seq_no, "predecessor ack channel closed");
                }
            }
            None => debug!(block = %self.id, "no predecessor to acknowledge"),
        }
    }

    /// Tail-side completion: answer the client and announce the change.
    async fn complete(&self, seq: SequenceId, op_id: i32, args: &[String], result: Vec<String>) {
        if seq.has_client() {
            self.respond(seq, result).await;
        }
        if self.partition.ops().is_mutator(op_id) {
            if let Some(name) = self.partition.ops().name_of(op_id) {
                for key in self.partition.affected_keys(op_id, args) {
                    self.subscriptions.notify(name, &key);
                }
            }
            self.maybe_autoscale(op_id);
        }
    }

    fn next_link(&self) -> StorageResult<Arc<dyn ChainLink>> {
        self.links.next().ok_or_else(|| StorageError::NoNextLink(self.id.to_string()))
    }

    fn violation(&self, reason: String) -> StorageError {
        StorageError::ChainViolation {
            block: self.id.to_string(),
            reason,
        }
    }
}
