//! RBAC objects granting the dashboard cluster access
//!
//! The dashboard talks to the cluster through a dedicated ServiceAccount
//! bound to the built-in `cluster-admin` role. Both objects are recreated
//! from scratch on install so their shape never drifts.

use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleRef, Subject};
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tracing::{error, info};

use crate::controller::error::{is_not_found, Result};
use crate::resources::common::{standard_labels, CLUSTER_ROLE_NAME, SERVICE_ACCOUNT_NAME};

/// Delete then create the ServiceAccount and ClusterRoleBinding.
///
/// Returns `Ok(false)` without touching anything when the prerequisite
/// cluster role is missing (RBAC disabled in the cluster), so the caller can
/// defer instead of failing.
pub async fn create_service_account(
    client: &Client,
    namespace: &str,
    app_name: &str,
) -> Result<bool> {
    info!("creating service account");
    let roles: Api<ClusterRole> = Api::all(client.clone());
    match roles.get(CLUSTER_ROLE_NAME).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {
            error!(
                "{} cluster role doesn't exist, please make sure RBAC is enabled in the cluster",
                CLUSTER_ROLE_NAME
            );
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    match accounts
        .delete(SERVICE_ACCOUNT_NAME, &DeleteParams::default())
        .await
    {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {
            info!(
                "{} service account doesn't exist, skip deletion",
                SERVICE_ACCOUNT_NAME
            )
        }
        Err(e) => return Err(e.into()),
    }
    accounts
        .create(
            &PostParams::default(),
            &ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(standard_labels(app_name)),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await?;

    info!("creating cluster role binding");
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    match bindings.delete(app_name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {
            info!("{} cluster role binding doesn't exist, skip deletion", app_name)
        }
        Err(e) => return Err(e.into()),
    }
    bindings
        .create(&PostParams::default(), &cluster_role_binding(namespace, app_name))
        .await?;
    Ok(true)
}

/// Remove the Service, ServiceAccount and ClusterRoleBinding.
///
/// Used on charm removal and by the delete-resources action; absence of any
/// object is tolerated so cleanup is safe to repeat.
pub async fn delete_resources(client: &Client, namespace: &str, app_name: &str) -> Result<()> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.delete(app_name, &DeleteParams::default()).await {
        Ok(_) => info!("deleted service {}", app_name),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    match accounts
        .delete(SERVICE_ACCOUNT_NAME, &DeleteParams::default())
        .await
    {
        Ok(_) => info!("deleted service account {}", SERVICE_ACCOUNT_NAME),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }

    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    match bindings.delete(app_name, &DeleteParams::default()).await {
        Ok(_) => info!("deleted cluster role binding {}", app_name),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cluster_role_binding(namespace: &str, app_name: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(app_name.to_string()),
            labels: Some(standard_labels(app_name)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_role_binding_shape() {
        let binding = cluster_role_binding("portainer-system", "portainer");
        assert_eq!(binding.metadata.name.as_deref(), Some("portainer"));
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, CLUSTER_ROLE_NAME);

        let subjects = binding.subjects.expect("subjects");
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, SERVICE_ACCOUNT_NAME);
        assert_eq!(subjects[0].namespace.as_deref(), Some("portainer-system"));
    }
}
