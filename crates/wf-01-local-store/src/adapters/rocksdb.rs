//! # RocksDB Backend
//!
//! Enabled with the `rocksdb` feature. Single default column family;
//! batches map onto `WriteBatch`.

use std::path::Path;

use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use crate::ports::{BatchOperation, KVStoreError, KeyValueStore};

/// RocksDB-backed key-value store.
pub struct RocksDbStore {
    db: RwLock<DB>,
}

impl RocksDbStore {
    /// Open or create a database directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KVStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);

        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| KVStoreError::io(format!("Failed to open RocksDB: {e}")))?;
        Ok(Self {
            db: RwLock::new(db),
        })
    }

    fn sync_writes() -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        write_opts
    }
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        self.db
            .read()
            .get(key)
            .map_err(|e| KVStoreError::io(format!("RocksDB get failed: {e}")))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        self.db
            .write()
            .put_opt(key, value, &Self::sync_writes())
            .map_err(|e| KVStoreError::io(format!("RocksDB put failed: {e}")))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KVStoreError> {
        self.db
            .write()
            .delete_opt(key, &Self::sync_writes())
            .map_err(|e| KVStoreError::io(format!("RocksDB delete failed: {e}")))
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        let mut batch = WriteBatch::default();
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => batch.put(&key, &value),
                BatchOperation::Delete { key } => batch.delete(&key),
            }
        }

        self.db
            .write()
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| KVStoreError::io(format!("RocksDB batch write failed: {e}")))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        let db = self.db.read();
        let mut results = Vec::new();
        for item in db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) =
                item.map_err(|e| KVStoreError::io(format!("RocksDB iteration failed: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }
}
