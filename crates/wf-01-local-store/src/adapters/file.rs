//! # File-Backed Store
//!
//! Keeps the whole keyspace in memory and rewrites a single file on every
//! write (temp file + fsync + rename). The record set is small: a handful of
//! nodes and their workers.
//!
//! Format: repeated `[key_len:u32 LE][key][value_len:u32 LE][value]`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use super::lock::StoreLock;
use super::memory::{apply, scan};
use crate::ports::{BatchOperation, KVStoreError, KeyValueStore};

/// File-backed key-value store guarded by an exclusive [`StoreLock`].
#[derive(Debug)]
pub struct FileBackedKVStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    path: PathBuf,
    _lock: StoreLock,
}

impl FileBackedKVStore {
    /// Open (or create) the store at `path`.
    ///
    /// A file that exists but cannot be decoded is an error, never an empty
    /// store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KVStoreError> {
        let path = path.as_ref().to_path_buf();
        let lock = StoreLock::acquire(&path)?;

        let data = if path.exists() {
            let data = Self::load_from_file(&path)?;
            info!(path = %path.display(), keys = data.len(), "loaded store");
            data
        } else {
            info!(path = %path.display(), "no existing store file");
            BTreeMap::new()
        };

        Ok(Self {
            data,
            path,
            _lock: lock,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_file(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, KVStoreError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        decode(&bytes)
    }

    fn save_to_file(&self) -> Result<(), KVStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = encode(&self.data)?;
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Apply `operations` to a copy and persist it; memory is only updated
    /// once the file is safely on disk.
    fn commit(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        let previous = self.data.clone();
        apply(&mut self.data, operations);
        if let Err(err) = self.save_to_file() {
            self.data = previous;
            return Err(err);
        }
        Ok(())
    }
}

fn encode(data: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<Vec<u8>, KVStoreError> {
    let mut bytes = Vec::new();
    for (key, value) in data {
        for field in [key, value] {
            let len = u32::try_from(field.len()).map_err(|_| KVStoreError::CorruptionError {
                message: "entry larger than 4 GiB".to_string(),
            })?;
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.extend_from_slice(field);
        }
    }
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, KVStoreError> {
    fn field<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], KVStoreError> {
        let at = *cursor;
        let truncated = move || KVStoreError::CorruptionError {
            message: format!("truncated entry at offset {at}"),
        };
        let len_bytes: [u8; 4] = bytes
            .get(*cursor..*cursor + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(truncated)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = *cursor + 4;
        let value = bytes.get(start..start + len).ok_or_else(truncated)?;
        *cursor = start + len;
        Ok(value)
    }

    let mut data = BTreeMap::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        let key = field(bytes, &mut cursor)?.to_vec();
        let value = field(bytes, &mut cursor)?.to_vec();
        data.insert(key, value);
    }
    Ok(data)
}

impl KeyValueStore for FileBackedKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        self.commit(vec![BatchOperation::put(key, value)])
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KVStoreError> {
        self.commit(vec![BatchOperation::delete(key)])
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        self.commit(operations)
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        Ok(scan(&self.data, prefix))
    }
}
