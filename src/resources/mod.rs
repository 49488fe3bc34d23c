//! Kubernetes-facing resource management
//!
//! [`ClusterResources`] is the seam between the orchestration logic and the
//! cluster API: the orchestrator only ever talks to this trait, which keeps
//! the event handlers testable without a cluster. [`KubeClusterResources`]
//! is the production implementation over a [`kube::Client`].

pub mod common;
pub mod rbac;
pub mod service;

pub use common::{
    read_namespace, service_labels, standard_labels, CLUSTER_ROLE_NAME, FIELD_MANAGER,
    NAMESPACE_FILE, SERVICE_ACCOUNT_NAME, SERVICE_VERSION, STACK_LABEL,
};
pub use service::{build_patch_operations, build_service_spec, clean_nones};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use crate::config::PortainerConfig;
use crate::controller::error::{is_forbidden, Result};

/// Cluster-side operations the orchestrator sequences.
///
/// Permission problems and missing RBAC preconditions surface as booleans;
/// everything else the cluster can return is a hard error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Probe whether the operator currently holds sufficient permission.
    async fn authenticate(&self) -> Result<bool>;

    /// Delete then create the dashboard Service from the configuration.
    async fn create_service(&self, app_name: &str, config: &PortainerConfig) -> Result<()>;

    /// Patch the dashboard Service in place from the configuration.
    async fn patch_service(&self, app_name: &str, config: &PortainerConfig) -> Result<()>;

    /// Recreate the ServiceAccount/ClusterRoleBinding pair; false when the
    /// prerequisite cluster role is missing.
    async fn create_service_account(&self, app_name: &str) -> Result<bool>;

    /// Remove every object the operator created.
    async fn delete_resources(&self, app_name: &str) -> Result<()>;
}

/// Production implementation over the real cluster API.
#[derive(Clone)]
pub struct KubeClusterResources {
    client: Client,
    namespace: String,
}

impl KubeClusterResources {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a manager scoped to the namespace the pod runs in.
    pub fn from_cluster(client: Client) -> Result<Self> {
        let namespace = read_namespace()?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl ClusterResources for KubeClusterResources {
    async fn authenticate(&self) -> Result<bool> {
        // Read-only probe: list services in our own namespace.
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(true),
            Err(e) if is_forbidden(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, app_name: &str, config: &PortainerConfig) -> Result<()> {
        service::create_service(&self.client, &self.namespace, app_name, config).await
    }

    async fn patch_service(&self, app_name: &str, config: &PortainerConfig) -> Result<()> {
        service::patch_service(&self.client, &self.namespace, app_name, config).await
    }

    async fn create_service_account(&self, app_name: &str) -> Result<bool> {
        rbac::create_service_account(&self.client, &self.namespace, app_name).await
    }

    async fn delete_resources(&self, app_name: &str) -> Result<()> {
        rbac::delete_resources(&self.client, &self.namespace, app_name).await
    }
}
