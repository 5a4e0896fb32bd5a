//! Ports of the local store.

pub mod outbound;

pub use outbound::{BatchOperation, KVStoreError, KeyValueStore};
