//! Portainer configuration model
//!
//! The operator's configuration surface is a flat key/value map with five
//! recognized keys describing how the dashboard is exposed. [`PortainerConfig`]
//! wraps the raw map and provides typed accessors, validation, merge semantics
//! and change classification. Unrecognized keys are ignored by validation but
//! survive a merge untouched.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration key for the Kubernetes service type.
pub const CONFIG_SERVICE_TYPE: &str = "service_type";
/// Configuration key for the dashboard HTTP port.
pub const CONFIG_SERVICE_HTTP_PORT: &str = "service_http_port";
/// Configuration key for the HTTP node port (NodePort only).
pub const CONFIG_SERVICE_HTTP_NODE_PORT: &str = "service_http_node_port";
/// Configuration key for the edge tunnel port.
pub const CONFIG_SERVICE_EDGE_PORT: &str = "service_edge_port";
/// Configuration key for the edge node port (NodePort only).
pub const CONFIG_SERVICE_EDGE_NODE_PORT: &str = "service_edge_node_port";

/// Default HTTP port for a fresh install.
pub const DEFAULT_SERVICE_HTTP_PORT: i32 = 9000;
/// Default edge tunnel port for a fresh install.
pub const DEFAULT_SERVICE_EDGE_PORT: i32 = 8000;

/// Kubernetes service types recognized by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    LoadBalancer,
    ClusterIP,
    NodePort,
}

impl ServiceType {
    /// Parse a service type from its Kubernetes spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LoadBalancer" => Some(ServiceType::LoadBalancer),
            "ClusterIP" => Some(ServiceType::ClusterIP),
            "NodePort" => Some(ServiceType::NodePort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of comparing two configurations.
///
/// Each field marks one kind of downstream side effect that has to run. The
/// two kinds are independent: a single update can set neither, either, or
/// both. Derived on every config-changed event, never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// The Service object's type/ports/selector need to be re-applied.
    pub service_changed: bool,
    /// The workload command line needs regeneration and a restart.
    pub cli_changed: bool,
}

impl ChangeSet {
    /// Check if any change was detected.
    pub fn has_changes(&self) -> bool {
        self.service_changed || self.cli_changed
    }

    pub fn is_empty(&self) -> bool {
        !self.has_changes()
    }
}

/// Flat key/value configuration for the Portainer workload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortainerConfig {
    values: BTreeMap<String, Value>,
}

impl Default for PortainerConfig {
    /// The configuration persisted at first initialization: a LoadBalancer
    /// exposing the default HTTP and edge ports.
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert(
            CONFIG_SERVICE_TYPE.to_string(),
            Value::String(ServiceType::LoadBalancer.as_str().to_string()),
        );
        values.insert(
            CONFIG_SERVICE_HTTP_PORT.to_string(),
            Value::from(DEFAULT_SERVICE_HTTP_PORT),
        );
        values.insert(
            CONFIG_SERVICE_EDGE_PORT.to_string(),
            Value::from(DEFAULT_SERVICE_EDGE_PORT),
        );
        Self { values }
    }
}

impl PortainerConfig {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Build a configuration from string values, e.g. ConfigMap data.
    ///
    /// Values that parse as integers become numbers so the port accessors
    /// see them; everything else is kept as a string.
    pub fn from_str_map<K, V>(data: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: AsRef<str>,
    {
        let values = data
            .into_iter()
            .map(|(k, v)| {
                let v = v.as_ref();
                let value = match v.parse::<i64>() {
                    Ok(n) => Value::from(n),
                    Err(_) => Value::String(v.to_string()),
                };
                (k.into(), value)
            })
            .collect();
        Self { values }
    }

    /// The configured service type, `None` when missing or unrecognized.
    pub fn service_type(&self) -> Option<ServiceType> {
        self.values
            .get(CONFIG_SERVICE_TYPE)
            .and_then(Value::as_str)
            .and_then(ServiceType::parse)
    }

    pub fn service_http_port(&self) -> Option<i32> {
        self.port_value(CONFIG_SERVICE_HTTP_PORT)
    }

    pub fn service_http_node_port(&self) -> Option<i32> {
        self.port_value(CONFIG_SERVICE_HTTP_NODE_PORT)
    }

    pub fn service_edge_port(&self) -> Option<i32> {
        self.port_value(CONFIG_SERVICE_EDGE_PORT)
    }

    pub fn service_edge_node_port(&self) -> Option<i32> {
        self.port_value(CONFIG_SERVICE_EDGE_NODE_PORT)
    }

    /// A port value must be a positive integer that fits a TCP port.
    fn port_value(&self, key: &str) -> Option<i32> {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .filter(|p| (1..=65535).contains(p))
            .map(|p| p as i32)
    }

    /// Whether the HTTP node port takes effect: requires NodePort type.
    pub fn is_http_node_port_configured(&self) -> bool {
        self.service_type() == Some(ServiceType::NodePort)
            && self.service_http_node_port().is_some()
    }

    /// Whether the edge node port takes effect: requires NodePort type.
    pub fn is_edge_node_port_configured(&self) -> bool {
        self.service_type() == Some(ServiceType::NodePort)
            && self.service_edge_node_port().is_some()
    }

    /// Classify what changed between this configuration and a candidate.
    ///
    /// The Service object must be re-applied when any of the five exposed
    /// fields differ. The command line only cares about the service type
    /// entering or leaving NodePort mode; a move between the other two types
    /// has no CLI-visible effect.
    pub fn compare(&self, target: &PortainerConfig) -> ChangeSet {
        let service_changed = self.service_type() != target.service_type()
            || self.service_http_port() != target.service_http_port()
            || self.service_edge_port() != target.service_edge_port()
            || self.service_http_node_port() != target.service_http_node_port()
            || self.service_edge_node_port() != target.service_edge_node_port();

        let cli_changed = self.service_type() != target.service_type()
            && (self.service_type() == Some(ServiceType::NodePort)
                || target.service_type() == Some(ServiceType::NodePort));

        ChangeSet {
            service_changed,
            cli_changed,
        }
    }

    /// Merge a candidate into this configuration, returning the result.
    ///
    /// Keys present in the candidate override the current values; absent
    /// keys retain their prior values, including unrecognized ones.
    pub fn merge(&self, target: &PortainerConfig) -> PortainerConfig {
        let mut values = self.values.clone();
        values.extend(target.values.clone());
        PortainerConfig { values }
    }

    /// Validate the configuration, accumulating every violation.
    ///
    /// An empty list means the configuration can be applied.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.service_type().is_none() {
            errors.push(format!(
                "config - service type {} is not recognized",
                self.values
                    .get(CONFIG_SERVICE_TYPE)
                    .map(Value::to_string)
                    .unwrap_or_else(|| "unset".to_string())
            ));
        }
        match (self.service_http_port(), self.service_edge_port()) {
            (Some(http), Some(edge)) if http == edge => {
                errors.push("config - service http and edge port cannot be the same".to_string());
            }
            (Some(_), Some(_)) => {}
            _ => {
                errors.push("config - service http and edge ports must both be set".to_string());
            }
        }
        if let (Some(http), Some(edge)) =
            (self.service_http_node_port(), self.service_edge_node_port())
            && http == edge
        {
            errors
                .push("config - service http and edge node port cannot be the same".to_string());
        }
        errors
    }

    /// Shallow copy of the underlying map.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.values.clone()
    }
}

impl fmt::Display for PortainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}
