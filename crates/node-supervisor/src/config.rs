//! # Supervisor Configuration
//!
//! Defaults, overridden from `WF_*` environment variables, then from
//! command-line flags.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `WF_DATA_DIR` | `data_dir` |
//! | `WF_STORE_BACKEND` | `store.backend` (`file`, `memory`, `rocksdb`) |
//! | `WF_STORE_PATH` | `store.path` |
//! | `WF_COORDINATOR_BIN` / `WF_VALIDATOR_BIN` | `binaries` |
//! | `WF_COORDINATOR_BOOTNODE_<NETWORK>` / `WF_VALIDATOR_BOOTNODE_<NETWORK>` | `binaries.bootnodes` |
//! | `WF_VALIDATOR_ADDRESS_<NETWORK>` | `workers.deposit_addresses` |
//! | `WF_POLL_INTERVAL_MS` / `WF_HEALTH_TIMEOUT_MS` / `WF_MAX_CONCURRENT_CHECKS` | `monitor` |
//! | `WF_STOP_GRACE_MS` / `WF_STARTUP_GRACE_MS` | `process` |
//! | `WF_ACTION_CONFIRM_TIMEOUT_SECS` | `workers.confirm_timeout` |
//! | `WF_RPC_TIMEOUT_MS` | `rpc_timeout` |
//! | `WF_LOG_LEVEL` or `RUST_LOG` / `WF_JSON_LOGS` | `log` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shared_types::Network;
use thiserror::Error;
use wf_02_node_manager::{Bootnodes, NodeManagerConfig};
use wf_03_worker_manager::WorkerManagerConfig;
use wf_04_status_monitor::MonitorConfig;
use wf_05_snapshot_manager::SnapshotConfig;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where node and worker records live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
    RocksDb,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StoreBackend::File),
            "memory" => Ok(StoreBackend::Memory),
            "rocksdb" => Ok(StoreBackend::RocksDb),
            _ => Err(ConfigError::InvalidValue {
                name: "store backend".into(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// `None` means `<data_dir>/supervisor.db`.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: None,
        }
    }
}

/// Coordinator and validator executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryConfig {
    pub coordinator: PathBuf,
    pub validator: PathBuf,
    pub bootnodes: Vec<(Network, Bootnodes)>,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            coordinator: PathBuf::from("coordinator"),
            validator: PathBuf::from("gwat"),
            bootnodes: Vec::new(),
        }
    }
}

/// Child process timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessConfig {
    pub startup_grace: Duration,
    pub stop_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        let defaults = NodeManagerConfig::default();
        Self {
            startup_grace: defaults.startup_grace,
            stop_grace: defaults.stop_grace,
        }
    }
}

impl From<ProcessConfig> for NodeManagerConfig {
    fn from(config: ProcessConfig) -> Self {
        NodeManagerConfig {
            startup_grace: config.startup_grace,
            stop_grace: config.stop_grace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root under which new nodes get their data directories.
    pub data_dir: PathBuf,
    pub store: StoreConfig,
    pub binaries: BinaryConfig,
    pub process: ProcessConfig,
    pub monitor: MonitorConfig,
    pub snapshot: SnapshotConfig,
    pub workers: WorkerManagerConfig,
    /// Per-request timeout of node RPC calls.
    pub rpc_timeout: Duration,
    /// Connection timeout of snapshot downloads.
    pub download_connect_timeout: Duration,
    pub log: LogConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(std::env::var("HOME").ok()),
            store: StoreConfig::default(),
            binaries: BinaryConfig::default(),
            process: ProcessConfig::default(),
            monitor: MonitorConfig::default(),
            snapshot: SnapshotConfig::default(),
            workers: WorkerManagerConfig::default(),
            rpc_timeout: Duration::from_secs(5),
            download_connect_timeout: Duration::from_secs(10),
            log: LogConfig::default(),
        }
    }
}

fn default_data_dir(home: Option<String>) -> PathBuf {
    match home {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".waterfall-supervisor"),
        _ => PathBuf::from("/var/lib/waterfall-supervisor"),
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

impl SupervisorConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            data_dir: default_data_dir(lookup("HOME")),
            ..Self::default()
        };

        if let Some(v) = lookup("WF_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WF_STORE_BACKEND") {
            config.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("WF_STORE_PATH") {
            config.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WF_COORDINATOR_BIN") {
            config.binaries.coordinator = PathBuf::from(v);
        }
        if let Some(v) = lookup("WF_VALIDATOR_BIN") {
            config.binaries.validator = PathBuf::from(v);
        }

        for network in Network::ALL {
            let suffix = network.as_str().to_ascii_uppercase();
            let bootnodes = Bootnodes {
                coordinator: lookup(&format!("WF_COORDINATOR_BOOTNODE_{suffix}")),
                validator: lookup(&format!("WF_VALIDATOR_BOOTNODE_{suffix}")),
            };
            if bootnodes != Bootnodes::default() {
                config.binaries.bootnodes.push((network, bootnodes));
            }
            if let Some(address) = lookup(&format!("WF_VALIDATOR_ADDRESS_{suffix}")) {
                config.workers.deposit_addresses.insert(network, address);
            }
        }

        if let Some(v) = lookup("WF_POLL_INTERVAL_MS") {
            config.monitor.poll_interval = Duration::from_millis(parse("WF_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("WF_HEALTH_TIMEOUT_MS") {
            config.monitor.check_timeout = Duration::from_millis(parse("WF_HEALTH_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("WF_MAX_CONCURRENT_CHECKS") {
            config.monitor.max_concurrent_checks = parse("WF_MAX_CONCURRENT_CHECKS", &v)?;
        }
        if let Some(v) = lookup("WF_STOP_GRACE_MS") {
            config.process.stop_grace = Duration::from_millis(parse("WF_STOP_GRACE_MS", &v)?);
        }
        if let Some(v) = lookup("WF_STARTUP_GRACE_MS") {
            config.process.startup_grace = Duration::from_millis(parse("WF_STARTUP_GRACE_MS", &v)?);
        }
        if let Some(v) = lookup("WF_ACTION_CONFIRM_TIMEOUT_SECS") {
            config.workers.confirm_timeout =
                Duration::from_secs(parse("WF_ACTION_CONFIRM_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("WF_RPC_TIMEOUT_MS") {
            config.rpc_timeout = Duration::from_millis(parse("WF_RPC_TIMEOUT_MS", &v)?);
        }

        if let Some(v) = lookup("WF_LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
            config.log.level = v;
        }
        if let Some(v) = lookup("WF_JSON_LOGS") {
            config.log.json = parse_bool("WF_JSON_LOGS", &v)?;
        }

        Ok(config)
    }

    /// Apply command-line flags on top.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(path) = &overrides.store_path {
            self.store.path = Some(path.clone());
        }
        if let Some(backend) = overrides.store_backend {
            self.store.backend = backend;
        }
        if let Some(bin) = &overrides.coordinator_bin {
            self.binaries.coordinator = bin.clone();
        }
        if let Some(bin) = &overrides.validator_bin {
            self.binaries.validator = bin.clone();
        }
        if let Some(ms) = overrides.poll_interval_ms {
            self.monitor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
        if overrides.json_logs {
            self.log.json = true;
        }
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "data dir {} must be absolute",
                self.data_dir.display()
            )));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be positive".into()));
        }
        if self.monitor.check_timeout.is_zero() {
            return Err(ConfigError::Invalid("health check timeout must be positive".into()));
        }
        if self.monitor.max_concurrent_checks == 0 {
            return Err(ConfigError::Invalid(
                "at least one concurrent health check is required".into(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Invalid("rpc timeout must be positive".into()));
        }
        if self.workers.confirm_timeout.is_zero() {
            return Err(ConfigError::Invalid("confirmation timeout must be positive".into()));
        }
        if cfg!(not(feature = "rocksdb")) && self.store.backend == StoreBackend::RocksDb {
            return Err(ConfigError::Invalid(
                "rocksdb backend requires the `rocksdb` feature".into(),
            ));
        }
        Ok(())
    }

    /// Store location after defaults.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("supervisor.db"))
    }
}

/// Flags of `node-supervisor serve`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Root of node data directories
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Store file (or directory for rocksdb)
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Store backend: file, memory or rocksdb
    #[arg(long)]
    pub store_backend: Option<StoreBackend>,

    /// Coordinator executable
    #[arg(long)]
    pub coordinator_bin: Option<PathBuf>,

    /// Validator (gwat) executable
    #[arg(long)]
    pub validator_bin: Option<PathBuf>,

    /// Health poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Log filter, e.g. `info,wf_02_node_manager=debug`
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
}
