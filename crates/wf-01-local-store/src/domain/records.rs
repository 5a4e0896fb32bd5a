//! Key layout and row encoding.
//!
//! ```text
//! nodes/{id:020}          Node JSON
//! workers/{id:020}        Worker JSON
//! health/{target}         consecutive failure count
//! meta/seq/{table}        last allocated id
//! meta/schema_version     applied migration version
//! meta/tables/{table}     table marker
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_types::{SupervisorError, SupervisorResult, TargetId};

pub const NODES: &str = "nodes";
pub const WORKERS: &str = "workers";
pub const HEALTH: &str = "health";
pub const TABLES: [&str; 3] = [NODES, WORKERS, HEALTH];

pub const SCHEMA_VERSION_KEY: &str = "meta/schema_version";

#[must_use]
pub fn table_prefix(table: &str) -> String {
    format!("{table}/")
}

/// Zero-padded so key order matches id order.
#[must_use]
pub fn row_key(table: &str, id: u64) -> String {
    format!("{table}/{id:020}")
}

#[must_use]
pub fn sequence_key(table: &str) -> String {
    format!("meta/seq/{table}")
}

#[must_use]
pub fn table_marker_key(table: &str) -> String {
    format!("meta/tables/{table}")
}

#[must_use]
pub fn health_key(target: &TargetId) -> String {
    format!("{HEALTH}/{}", target.key())
}

pub fn encode<T: Serialize>(record: &T) -> SupervisorResult<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> SupervisorResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        SupervisorError::Storage(format!(
            "corrupt row {}: {e}",
            String::from_utf8_lossy(key)
        ))
    })
}

pub fn decode_value(key: &[u8], bytes: &[u8]) -> SupervisorResult<Value> {
    decode(key, bytes)
}

pub fn decode_u64(key: &[u8], bytes: &[u8]) -> SupervisorResult<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        SupervisorError::Storage(format!(
            "corrupt counter {}",
            String::from_utf8_lossy(key)
        ))
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{NodeId, WorkerId};

    #[test]
    fn test_row_keys_sort_numerically() {
        assert!(row_key(NODES, 9) < row_key(NODES, 10));
        assert_eq!(row_key(WORKERS, 1), "workers/00000000000000000001");
    }

    #[test]
    fn test_health_keys() {
        assert_eq!(health_key(&TargetId::Node(NodeId(2))), "health/node:2");
        assert_eq!(health_key(&TargetId::Worker(WorkerId(5))), "health/worker:5");
    }

    #[test]
    fn test_counter_decoding() {
        assert_eq!(decode_u64(b"k", &7u64.to_be_bytes()).unwrap(), 7);
        assert!(decode_u64(b"k", b"short").is_err());
    }
}
