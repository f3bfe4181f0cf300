use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use slotkv_types::ops::kv;
use slotkv_types::{hash_slot, kv_ops, reply, OpTable};

use crate::error::{StorageError, StorageResult};
use crate::partition::{Partition, SlotView};

/// Tuning for hash-table partitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Bytes of key and value data a block may hold.
    pub capacity: u64,
    /// Fraction of capacity below which a block asks to merge.
    pub threshold_lo: f64,
    /// Fraction of capacity above which a block asks to split.
    pub threshold_hi: f64,
    /// Key/value pairs moved per locked batch during export.
    pub export_batch: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            capacity: 134_217_728,
            threshold_lo: 0.05,
            threshold_hi: 0.95,
            export_batch: 1024,
        }
    }
}

/// Hash-table partition.
///
/// `put` only inserts; `update` and `remove` return the previous value. The
/// explicit lock is a flag checked by `locked_*` operations; keeping other
/// operations out while it is set is the chain's job.
pub struct HashTablePartition {
    ops: OpTable,
    table: RwLock<HashMap<String, String>>,
    bytes: AtomicU64,
    locked: AtomicBool,
    config: KvConfig,
}

impl HashTablePartition {
    pub fn new(config: KvConfig) -> Self {
        Self {
            ops: kv_ops(),
            table: RwLock::new(HashMap::new()),
            bytes: AtomicU64::new(0),
            locked: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, view: &SlotView, key: &str, value: &str, redirected: bool) -> String {
        let slot = hash_slot(key);
        if !view.serves(slot, redirected) {
            return reply::BLOCK_MOVED.to_string();
        }
        if let Some(redirect) = view.export_redirect(slot) {
            return redirect;
        }
        let mut table = self.table.write().expect("lock poisoned");
        if table.contains_key(key) {
            return reply::DUPLICATE_KEY.to_string();
        }
        table.insert(key.to_string(), value.to_string());
        self.bytes.fetch_add((key.len() + value.len()) as u64, Ordering::SeqCst);
        reply::OK.to_string()
    }

    /// Shared shape of every existing-key operation: serve if present, else
    /// redirect if the slot is being exported, else report the key missing.
    fn with_existing<F>(&self, view: &SlotView, key: &str, redirected: bool, f: F) -> String
    where
        F: FnOnce(&mut HashMap<String, String>) -> Option<String>,
    {
        let slot = hash_slot(key);
        if !view.serves(slot, redirected) {
            return reply::BLOCK_MOVED.to_string();
        }
        let mut table = self.table.write().expect("lock poisoned");
        match f(&mut *table) {
            Some(v) => v,
            None => view
                .export_redirect(slot)
                .unwrap_or_else(|| reply::KEY_NOT_FOUND.to_string()),
        }
    }

    fn get(&self, view: &SlotView, key: &str, redirected: bool) -> String {
        self.with_existing(view, key, redirected, |t| t.get(key).cloned())
    }

    fn exists(&self, view: &SlotView, key: &str, redirected: bool) -> String {
        self.with_existing(view, key, redirected, |t| t.contains_key(key).then(|| "true".to_string()))
    }

    fn update(&self, view: &SlotView, key: &str, value: &str, redirected: bool) -> String {
        self.with_existing(view, key, redirected, |t| {
            let slot = t.get_mut(key)?;
            let old = std::mem::replace(slot, value.to_string());
            self.bytes.fetch_add(value.len() as u64, Ordering::SeqCst);
            self.bytes.fetch_sub(old.len() as u64, Ordering::SeqCst);
            Some(old)
        })
    }

    fn remove(&self, view: &SlotView, key: &str, redirected: bool) -> String {
        self.with_existing(view, key, redirected, |t| {
            let old = t.remove(key)?;
            self.bytes.fetch_sub((key.len() + old.len()) as u64, Ordering::SeqCst);
            Some(old)
        })
    }

    fn lock(&self, view: &SlotView) -> String {
        self.locked.store(true, Ordering::SeqCst);
        if view.state == slotkv_types::BlockState::Exporting {
            format!("!{}", slotkv_types::BlockId::join_chain(&view.export_target))
        } else {
            reply::OK.to_string()
        }
    }

    fn unlock(&self) -> String {
        self.locked.store(false, Ordering::SeqCst);
        reply::OK.to_string()
    }

    /// Up to `limit` key/value pairs whose slot lies in `[begin, end]`, flattened.
    fn data_in_slot_range(&self, begin: i32, end: i32, limit: usize) -> Vec<String> {
        let table = self.table.read().expect("lock poisoned");
        table
            .iter()
            .filter(|(k, _)| {
                let slot = hash_slot(k);
                slot >= begin && slot <= end
            })
            .take(limit)
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect()
    }

    fn per_key<F>(args: &[String], f: F) -> Vec<String>
    where
        F: Fn(&str) -> String,
    {
        args.iter().map(|k| f(k)).collect()
    }

    fn per_pair<F>(args: &[String], f: F) -> Vec<String>
    where
        F: Fn(&str, &str) -> String,
    {
        if args.len() % 2 != 0 {
            return vec![reply::ARGS_ERROR.to_string()];
        }
        args.chunks(2).map(|kv| f(&kv[0], &kv[1])).collect()
    }

    fn is_locked_op(op_id: i32) -> bool {
        matches!(
            op_id,
            kv::LOCKED_GET_DATA_IN_SLOT_RANGE
                | kv::LOCKED_GET
                | kv::LOCKED_PUT
                | kv::LOCKED_REMOVE
                | kv::LOCKED_UPDATE
        )
    }
}

impl Partition for HashTablePartition {
    fn ops(&self) -> &OpTable {
        &self.ops
    }

    fn run_command(&self, view: &SlotView, op_id: i32, args: &[String]) -> StorageResult<Vec<String>> {
        let (args, redirected) = match args.split_last() {
            Some((last, rest)) if last == reply::REDIRECTED => (rest, true),
            _ => (args, false),
        };
        if Self::is_locked_op(op_id) && !self.is_locked() {
            return Ok(vec![reply::BLOCK_NOT_LOCKED.to_string()]);
        }
        let no_args = |f: &dyn Fn() -> Vec<String>| {
            if args.is_empty() {
                f()
            } else {
                vec![reply::ARGS_ERROR.to_string()]
            }
        };
        let result = match op_id {
            kv::EXISTS => Self::per_key(args, |k| self.exists(view, k, redirected)),
            kv::GET | kv::LOCKED_GET => Self::per_key(args, |k| self.get(view, k, redirected)),
            kv::KEYS => no_args(&|| self.table.read().expect("lock poisoned").keys().cloned().collect()),
            kv::NUM_KEYS => no_args(&|| vec![self.len().to_string()]),
            kv::PUT | kv::LOCKED_PUT => Self::per_pair(args, |k, v| self.put(view, k, v, redirected)),
            kv::UPDATE | kv::LOCKED_UPDATE => Self::per_pair(args, |k, v| self.update(view, k, v, redirected)),
            kv::REMOVE | kv::LOCKED_REMOVE => Self::per_key(args, |k| self.remove(view, k, redirected)),
            kv::LOCK => no_args(&|| vec![self.lock(view)]),
            kv::UNLOCK => no_args(&|| vec![self.unlock()]),
            kv::LOCKED_GET_DATA_IN_SLOT_RANGE => match args {
                [begin, end, limit] => match (begin.parse(), end.parse(), limit.parse()) {
                    (Ok(b), Ok(e), Ok(n)) => self.data_in_slot_range(b, e, n),
                    _ => vec![reply::ARGS_ERROR.to_string()],
                },
                _ => vec![reply::ARGS_ERROR.to_string()],
            },
            other => return Err(StorageError::UnknownOp(other)),
        };
        Ok(result)
    }

    fn affected_keys(&self, op_id: i32, args: &[String]) -> Vec<String> {
        let args = match args.split_last() {
            Some((last, rest)) if last == reply::REDIRECTED => rest,
            _ => args,
        };
        match op_id {
            kv::PUT | kv::LOCKED_PUT | kv::UPDATE | kv::LOCKED_UPDATE => {
                args.iter().step_by(2).cloned().collect()
            }
            kv::REMOVE | kv::LOCKED_REMOVE => args.to_vec(),
            _ => Vec::new(),
        }
    }

    fn bypasses_lock(&self, op_id: i32) -> bool {
        op_id == kv::UNLOCK || Self::is_locked_op(op_id)
    }

    fn shrinks(&self, op_id: i32) -> bool {
        op_id == kv::REMOVE
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn storage_size(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn storage_capacity(&self) -> u64 {
        self.config.capacity
    }

    fn overloaded(&self) -> bool {
        self.storage_size() as f64 > self.config.capacity as f64 * self.config.threshold_hi
    }

    fn underloaded(&self) -> bool {
        (self.storage_size() as f64) < self.config.capacity as f64 * self.config.threshold_lo
    }

    fn clear(&self) {
        self.table.write().expect("lock poisoned").clear();
        self.bytes.store(0, Ordering::SeqCst);
        self.locked.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self) -> StorageResult<Vec<u8>> {
        let table = self.table.read().expect("lock poisoned");
        bincode::serialize(&*table).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn restore(&self, bytes: &[u8]) -> StorageResult<()> {
        let restored: HashMap<String, String> =
            bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let size: u64 = restored.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        *self.table.write().expect("lock poisoned") = restored;
        self.bytes.store(size, Ordering::SeqCst);
        Ok(())
    }

    fn replay_commands(&self) -> Vec<(i32, Vec<String>)> {
        let table = self.table.read().expect("lock poisoned");
        let pairs: Vec<String> = table.iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect();
        pairs
            .chunks(self.config.export_batch.max(1) * 2)
            .map(|chunk| {
                let mut args = chunk.to_vec();
                args.push(reply::REDIRECTED.to_string());
                (kv::PUT, args)
            })
            .collect()
    }
}

impl std::fmt::Debug for HashTablePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTablePartition")
            .field("keys", &self.len())
            .field("bytes", &self.storage_size())
            .field("locked", &self.is_locked())
            .finish()
    }
}
