//! # Data Directory Layout
//!
//! Pure path derivation for a node's `data_path`. Nothing here touches the
//! filesystem.
//!
//! ```text
//! <data_path>/
//! ├── coordinator/
//! │   └── wallet/
//! │       ├── keys/<name>
//! │       └── password.txt
//! ├── gwat/
//! │   ├── keystore/<name>
//! │   ├── password.txt
//! │   └── gwat/nodekey
//! ├── logs/
//! ├── snapshot.tar
//! ├── snapshot.tar.part          (download in progress)
//! ├── .snapshot-staging/         (archive extracted here before swap)
//! ├── .snapshot-previous/        (live data moved aside during swap)
//! └── .snapshot-apply.journal    (present only while a swap is underway)
//! ```

use std::path::{Path, PathBuf};

/// Layout helper bound to one node's data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn coordinator(&self) -> PathBuf {
        self.root.join("coordinator")
    }

    pub fn coordinator_wallet(&self) -> PathBuf {
        self.coordinator().join("wallet")
    }

    pub fn coordinator_keys(&self) -> PathBuf {
        self.coordinator_wallet().join("keys")
    }

    pub fn coordinator_key(&self, name: &str) -> PathBuf {
        self.coordinator_keys().join(name)
    }

    pub fn coordinator_wallet_password(&self) -> PathBuf {
        self.coordinator_wallet().join("password.txt")
    }

    /// Validator (gwat) data directory.
    pub fn validator(&self) -> PathBuf {
        self.root.join("gwat")
    }

    pub fn validator_keystore(&self) -> PathBuf {
        self.validator().join("keystore")
    }

    pub fn validator_keystore_file(&self, name: &str) -> PathBuf {
        self.validator_keystore().join(name)
    }

    pub fn validator_password(&self) -> PathBuf {
        self.validator().join("password.txt")
    }

    pub fn validator_node_key(&self) -> PathBuf {
        self.validator().join("gwat").join("nodekey")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log file for one process role, e.g. `logs/coordinator.log`.
    pub fn process_log(&self, role: &str) -> PathBuf {
        self.logs().join(format!("{role}.log"))
    }

    /// Fully downloaded snapshot archive.
    pub fn snapshot_archive(&self) -> PathBuf {
        self.root.join("snapshot.tar")
    }

    /// Archive while the download is still in progress.
    pub fn snapshot_partial(&self) -> PathBuf {
        self.root.join("snapshot.tar.part")
    }

    pub fn snapshot_staging(&self) -> PathBuf {
        self.root.join(".snapshot-staging")
    }

    pub fn snapshot_previous(&self) -> PathBuf {
        self.root.join(".snapshot-previous")
    }

    /// Marker present only while live data is being swapped.
    pub fn snapshot_journal(&self) -> PathBuf {
        self.root.join(".snapshot-apply.journal")
    }

    /// Directories created for every new node.
    pub fn skeleton(&self) -> [PathBuf; 4] {
        [
            self.coordinator_keys(),
            self.validator_keystore(),
            self.validator().join("gwat"),
            self.logs(),
        ]
    }

    /// Node identity material, relative to the root. Carried over from the
    /// live tree when a snapshot replaces chain data.
    pub fn identity_entries() -> [&'static str; 4] {
        [
            "coordinator/wallet",
            "gwat/keystore",
            "gwat/password.txt",
            "gwat/gwat/nodekey",
        ]
    }

    /// Top-level entries owned by the supervisor itself. Snapshot archives
    /// never replace these.
    pub fn is_reserved_entry(name: &str) -> bool {
        matches!(
            name,
            "logs"
                | "snapshot.tar"
                | "snapshot.tar.part"
                | ".snapshot-staging"
                | ".snapshot-previous"
                | ".snapshot-apply.journal"
        )
    }
}
