//! # Local Store
//!
//! Persisted Node and Worker records, plus the per-target health counters
//! the status monitor keeps.
//!
//! ## Architecture
//!
//! ```text
//! LocalStore (service.rs)
//!   ├── migrations.rs        versioned schema steps, one atomic batch
//!   ├── domain/query.rs      condition builder + evaluator
//!   ├── domain/filters.rs    typed node/worker filters
//!   └── ports::KeyValueStore
//!         ├── adapters::memory   (tests)
//!         ├── adapters::file     (default, fs2-locked)
//!         └── adapters::rocksdb  (feature `rocksdb`)
//! ```
//!
//! Writes are serialized per record through a row-lock table; unrelated
//! records never contend.

pub mod adapters;
pub mod domain;
pub mod migrations;
pub mod ports;
pub mod service;

pub use adapters::{FileBackedKVStore, InMemoryKVStore, StoreLock};
#[cfg(feature = "rocksdb")]
pub use adapters::RocksDbStore;
pub use domain::filters::{NodeFilter, WorkerFilter};
pub use domain::query::{append_condition, append_json_condition, Condition, Query};
pub use migrations::{Migration, MigrationRunner, MIGRATIONS};
pub use ports::{BatchOperation, KVStoreError, KeyValueStore};
pub use service::LocalStore;
