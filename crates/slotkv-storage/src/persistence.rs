use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Backing store for partition snapshots.
///
/// Snapshot names are the object paths the directory hands out, e.g.
/// `local://backing/file/0_65536`.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Read a snapshot back. Returns `Ok(None)` if it does not exist.
    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Delete a snapshot. Returns `true` if it existed.
    fn remove(&self, name: &str) -> StorageResult<bool>;
}

/// Frame a snapshot payload:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload]
/// ```
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Unframe and verify a snapshot.
pub fn decode_frame(name: &str, data: &[u8]) -> StorageResult<Vec<u8>> {
    let corrupt = |reason: String| StorageError::CorruptSnapshot {
        path: name.to_string(),
        reason,
    };
    if data.len() < HEADER_SIZE {
        return Err(corrupt(format!("{} bytes is shorter than the header", data.len())));
    }
    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let expected_crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let payload = &data[HEADER_SIZE..];
    if payload.len() != length {
        return Err(corrupt(format!("length {length}, found {}", payload.len())));
    }
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(corrupt(format!("crc {expected_crc:#x}, computed {actual_crc:#x}")));
    }
    Ok(payload.to_vec())
}

/// Snapshots as files under a root directory.
///
/// The scheme prefix of a name (`local://`, `s3://`) is dropped and the rest
/// is joined under the root.
#[derive(Debug)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> PathBuf {
        let bare = name.split_once("://").map_or(name, |(_, rest)| rest);
        self.root.join(bare.trim_start_matches('/'))
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn save(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves a torn snapshot in place.
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_frame(data))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), len = data.len(), "snapshot saved");
        Ok(())
    }

    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.file_path(name);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        decode_frame(name, &data).map(Some)
    }

    fn remove(&self, name: &str) -> StorageResult<bool> {
        match fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory snapshot store for tests and single-process clusters.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshots.read().expect("lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.snapshots
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), encode_frame(data));
        Ok(())
    }

    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let snapshots = self.snapshots.read().expect("lock poisoned");
        snapshots.get(name).map(|d| decode_frame(name, d)).transpose()
    }

    fn remove(&self, name: &str) -> StorageResult<bool> {
        Ok(self.snapshots.write().expect("lock poisoned").remove(name).is_some())
    }
}
