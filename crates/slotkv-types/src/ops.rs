use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Whether an operation reads or writes partition state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Served by the tail, not replicated.
    Accessor,
    /// Sent to the head and replicated down the chain.
    Mutator,
}

/// One entry of an operation table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInfo {
    pub id: i32,
    pub name: String,
    pub kind: OpKind,
}

/// Immutable capability table for one partition type.
///
/// Operation ids are positions in the table. The table is built once and
/// handed to every partition and client that needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpTable {
    ops: Vec<OpInfo>,
    by_name: HashMap<String, i32>,
}

impl OpTable {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, OpKind)>) -> Self {
        let ops: Vec<OpInfo> = entries
            .into_iter()
            .enumerate()
            .map(|(i, (name, kind))| OpInfo {
                id: i as i32,
                name: name.to_string(),
                kind,
            })
            .collect();
        let by_name = ops.iter().map(|op| (op.name.clone(), op.id)).collect();
        Self { ops, by_name }
    }

    pub fn get(&self, id: i32) -> Option<&OpInfo> {
        usize::try_from(id).ok().and_then(|i| self.ops.get(i))
    }

    pub fn id_of(&self, name: &str) -> Result<i32, TypeError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TypeError::UnknownOp(name.to_string()))
    }

    pub fn name_of(&self, id: i32) -> Option<&str> {
        self.get(id).map(|op| op.name.as_str())
    }

    pub fn is_accessor(&self, id: i32) -> bool {
        matches!(self.get(id), Some(op) if op.kind == OpKind::Accessor)
    }

    pub fn is_mutator(&self, id: i32) -> bool {
        matches!(self.get(id), Some(op) if op.kind == OpKind::Mutator)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpInfo> {
        self.ops.iter()
    }
}

/// Operation ids of the hash-table partition.
pub mod kv {
    pub const EXISTS: i32 = 0;
    pub const GET: i32 = 1;
    pub const KEYS: i32 = 2;
    pub const NUM_KEYS: i32 = 3;
    pub const PUT: i32 = 4;
    pub const REMOVE: i32 = 5;
    pub const UPDATE: i32 = 6;
    pub const LOCK: i32 = 7;
    pub const UNLOCK: i32 = 8;
    pub const LOCKED_GET_DATA_IN_SLOT_RANGE: i32 = 9;
    pub const LOCKED_GET: i32 = 10;
    pub const LOCKED_PUT: i32 = 11;
    pub const LOCKED_REMOVE: i32 = 12;
    pub const LOCKED_UPDATE: i32 = 13;
}

/// Capability table of the hash-table partition.
pub fn kv_ops() -> OpTable {
    use OpKind::{Accessor, Mutator};
    OpTable::new([
        ("exists", Accessor),
        ("get", Accessor),
        ("keys", Accessor),
        ("num_keys", Accessor),
        ("put", Mutator),
        ("remove", Mutator),
        ("update", Mutator),
        ("lock", Mutator),
        ("unlock", Mutator),
        ("locked_get_data_in_slot_range", Accessor),
        ("locked_get", Accessor),
        ("locked_put", Mutator),
        ("locked_remove", Mutator),
        ("locked_update", Mutator),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_ids_match_positions() {
        let ops = kv_ops();
        assert_eq!(ops.len(), 14);
        assert_eq!(ops.id_of("exists").unwrap(), kv::EXISTS);
        assert_eq!(ops.id_of("put").unwrap(), kv::PUT);
        assert_eq!(ops.id_of("unlock").unwrap(), kv::UNLOCK);
        assert_eq!(ops.id_of("locked_update").unwrap(), kv::LOCKED_UPDATE);
    }

    #[test]
    fn kinds() {
        let ops = kv_ops();
        assert!(ops.is_accessor(kv::GET));
        assert!(ops.is_accessor(kv::LOCKED_GET_DATA_IN_SLOT_RANGE));
        assert!(ops.is_mutator(kv::LOCK));
        assert!(ops.is_mutator(kv::LOCKED_REMOVE));
    }

    #[test]
    fn unknown_ops() {
        let ops = kv_ops();
        assert!(ops.get(-1).is_none());
        assert!(ops.get(99).is_none());
        assert!(!ops.is_accessor(99) && !ops.is_mutator(99));
        assert_eq!(ops.id_of("frobnicate"), Err(TypeError::UnknownOp("frobnicate".into())));
    }
}
