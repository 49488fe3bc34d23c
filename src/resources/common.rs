//! Common utilities for Kubernetes resource generation
//!
//! Shared constants and label builders used by the service and RBAC
//! reconcilers, plus the in-cluster namespace lookup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::controller::error::Result;

/// Fixed software version label applied to every managed resource.
pub const SERVICE_VERSION: &str = "portainer-ee";

/// Label used by the Portainer UI to group its own resources.
pub const STACK_LABEL: &str = "io.portainer.kubernetes.application.stack";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "portainer-operator";

/// ServiceAccount granted cluster access for the dashboard.
pub const SERVICE_ACCOUNT_NAME: &str = "portainer-sa-clusteradmin";

/// Cluster role the dashboard's ServiceAccount is bound to. The operator
/// only verifies it exists; it never creates it.
pub const CLUSTER_ROLE_NAME: &str = "cluster-admin";

/// Mounted file carrying the namespace of the running pod.
pub const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Generate the identifying labels applied to every managed resource.
pub fn standard_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), app_name.to_string()),
        (
            "app.kubernetes.io/instance".to_string(),
            app_name.to_string(),
        ),
        (
            "app.kubernetes.io/version".to_string(),
            SERVICE_VERSION.to_string(),
        ),
    ])
}

/// Labels for the Service object: standard labels plus the stack label the
/// dashboard uses to recognize its own Service.
pub fn service_labels(app_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(app_name);
    labels.insert(STACK_LABEL.to_string(), app_name.to_string());
    labels
}

/// Read the current namespace from the mounted ServiceAccount token.
///
/// Any read failure propagates; without a namespace no cluster call can be
/// scoped correctly.
pub fn read_namespace() -> Result<String> {
    read_namespace_from(Path::new(NAMESPACE_FILE))
}

pub fn read_namespace_from(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}
