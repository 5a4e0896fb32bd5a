//! Command lines for the coordinator and `gwat` binaries.

use std::collections::HashMap;
use std::path::PathBuf;

use shared_types::{DataLayout, Network, Node, SupervisorError, SupervisorResult};

use crate::domain::ProcessRole;
use crate::ports::{CommandBuilder, LaunchSpec};

/// Bootnode addresses of one network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bootnodes {
    pub coordinator: Option<String>,
    pub validator: Option<String>,
}

/// Default [`CommandBuilder`] for the Waterfall binaries.
#[derive(Debug, Clone)]
pub struct WaterfallCommands {
    pub coordinator_bin: PathBuf,
    pub validator_bin: PathBuf,
    pub bootnodes: HashMap<Network, Bootnodes>,
}

impl WaterfallCommands {
    pub fn new(coordinator_bin: impl Into<PathBuf>, validator_bin: impl Into<PathBuf>) -> Self {
        Self {
            coordinator_bin: coordinator_bin.into(),
            validator_bin: validator_bin.into(),
            bootnodes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_bootnodes(mut self, network: Network, bootnodes: Bootnodes) -> Self {
        self.bootnodes.insert(network, bootnodes);
        self
    }

    fn coordinator_args(&self, node: &Node, layout: &DataLayout) -> Vec<String> {
        let ports = &node.ports;
        let mut args = vec![
            node.network.coordinator_flag().to_string(),
            "--accept-terms-of-use".to_string(),
            "--datadir".to_string(),
            layout.coordinator().display().to_string(),
            "--p2p-tcp-port".to_string(),
            ports.coordinator_p2p_tcp.to_string(),
            "--p2p-udp-port".to_string(),
            ports.coordinator_p2p_udp.to_string(),
            "--grpc-gateway-port".to_string(),
            ports.coordinator_http_api.to_string(),
            "--rpc-port".to_string(),
            ports.coordinator_http_validator_api.to_string(),
        ];
        if let Some(bootnode) = self
            .bootnodes
            .get(&node.network)
            .and_then(|b| b.coordinator.as_ref())
        {
            args.extend(["--bootstrap-node".to_string(), bootnode.clone()]);
        }
        args
    }

    fn validator_args(&self, node: &Node, layout: &DataLayout) -> Vec<String> {
        let ports = &node.ports;
        let mut args = vec![
            node.network.validator_flag().to_string(),
            "--datadir".to_string(),
            layout.validator().display().to_string(),
            "--port".to_string(),
            ports.validator_p2p.to_string(),
            "--http".to_string(),
            "--http.addr".to_string(),
            "127.0.0.1".to_string(),
            "--http.port".to_string(),
            ports.validator_http_api.to_string(),
            "--ws".to_string(),
            "--ws.port".to_string(),
            ports.validator_ws_api.to_string(),
        ];
        if let Some(bootnode) = self
            .bootnodes
            .get(&node.network)
            .and_then(|b| b.validator.as_ref())
        {
            args.extend(["--bootnodes".to_string(), bootnode.clone()]);
        }
        args
    }
}

impl CommandBuilder for WaterfallCommands {
    fn build(&self, node: &Node, role: ProcessRole) -> SupervisorResult<LaunchSpec> {
        let layout = DataLayout::new(&node.data_path);
        let (program, args, working_dir) = match role {
            ProcessRole::Coordinator => (
                self.coordinator_bin.clone(),
                self.coordinator_args(node, &layout),
                layout.coordinator(),
            ),
            ProcessRole::Validator => (
                self.validator_bin.clone(),
                self.validator_args(node, &layout),
                layout.validator(),
            ),
        };

        if program.as_os_str().is_empty() {
            return Err(SupervisorError::Precondition(format!(
                "no binary configured for {role}"
            )));
        }

        Ok(LaunchSpec {
            role,
            program,
            args,
            env: Vec::new(),
            working_dir,
            log_path: layout.process_log(role.as_str()),
        })
    }
}
