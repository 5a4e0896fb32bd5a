//! Storage backends.

pub mod file;
pub mod lock;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;

pub use file::FileBackedKVStore;
pub use lock::StoreLock;
pub use memory::InMemoryKVStore;
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::RocksDbStore;
