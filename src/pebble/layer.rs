//! Pebble layer and command construction
//!
//! The dashboard runs as a single Pebble service. Its command line is a
//! function of the configuration: entering NodePort mode with a configured
//! edge node port tells the binary which host port the edge tunnel is
//! reachable on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PortainerConfig;

/// Workload container name; also the Pebble service name.
pub const CONTAINER_NAME: &str = "portainer";

/// Name of the Pebble service and the layer label it lives under.
pub const PEBBLE_SERVICE: &str = CONTAINER_NAME;

/// The dashboard binary inside the workload container.
pub const PORTAINER_BIN: &str = "/portainer";

/// A Pebble layer: a named set of service definitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub services: BTreeMap<String, LayerService>,
}

/// One service definition within a layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerService {
    #[serde(rename = "override")]
    pub override_: String,
    pub command: String,
    pub startup: String,
}

/// Build the command line for the dashboard process.
pub fn dashboard_command(config: &PortainerConfig) -> String {
    let mut cmd = PORTAINER_BIN.to_string();
    if config.is_edge_node_port_configured()
        && let Some(port) = config.service_edge_node_port()
    {
        cmd.push_str(&format!(" --tunnel-port {}", port));
    }
    cmd
}

/// Build the layer registered with Pebble for the given configuration.
pub fn build_layer(config: &PortainerConfig) -> Layer {
    Layer {
        services: BTreeMap::from([(
            PEBBLE_SERVICE.to_string(),
            LayerService {
                override_: "replace".to_string(),
                command: dashboard_command(config),
                startup: "enabled".to_string(),
            },
        )]),
    }
}
