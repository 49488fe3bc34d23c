//! Pebble process supervisor integration
//!
//! The workload container runs under Pebble, a small process supervisor
//! reachable over a unix socket. [`Pebble`] is the seam the orchestrator
//! sequences against: registering the command definition, starting and
//! restarting the dashboard. The wire protocol lives entirely in
//! [`client`]; [`manager`] holds the reachability-gated start/update logic.

pub mod client;
pub mod layer;
pub mod manager;

pub use client::{ClientError, PebbleClient};
pub use layer::{build_layer, dashboard_command, Layer, LayerService, CONTAINER_NAME, PEBBLE_SERVICE};
pub use manager::{start_service, update_service};

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

/// Status of a service as reported by the supervisor.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    /// Current state, e.g. "active" or "inactive".
    pub current: String,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.current == "active"
    }
}

/// Operations the supervisor exposes for one workload container.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Pebble: Send + Sync {
    /// Whether the supervisor's socket is reachable yet.
    async fn can_connect(&self) -> bool;

    /// Look up a registered service by name.
    async fn get_service(&self, name: &str) -> Result<Option<ServiceStatus>, ClientError>;

    /// Register or replace a named command definition.
    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<(), ClientError>;

    /// Start a service.
    async fn start(&self, name: &str) -> Result<(), ClientError>;

    /// Restart a service.
    async fn restart(&self, name: &str) -> Result<(), ClientError>;
}
