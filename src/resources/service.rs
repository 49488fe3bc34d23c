//! Service reconciliation for the Portainer dashboard
//!
//! The dashboard is exposed through a single Service with two named ports:
//! `http` (the UI, targetPort 9000) and `edge` (the edge-agent tunnel,
//! targetPort 8000). Creation is delete-then-recreate so repeated installs
//! converge on the same spec; updates go through an RFC 6902 JSON patch that
//! replaces whole top-level spec fields.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{
    PortainerConfig, ServiceType, DEFAULT_SERVICE_EDGE_PORT, DEFAULT_SERVICE_HTTP_PORT,
};
use crate::controller::error::{is_not_found, Result};
use crate::resources::common::service_labels;

/// Container-side port of the dashboard UI.
const HTTP_TARGET_PORT: i32 = 9000;

/// Container-side port of the edge tunnel server.
const EDGE_TARGET_PORT: i32 = 8000;

/// Build the Service spec for the given configuration.
///
/// Node ports are only attached when the corresponding node port is
/// configured together with the NodePort service type; for the other types
/// the field stays unset and the API server picks nothing.
pub fn build_service_spec(app_name: &str, config: &PortainerConfig) -> ServiceSpec {
    let service_type = config
        .service_type()
        .unwrap_or(ServiceType::LoadBalancer);

    let http_port = ServicePort {
        name: Some("http".to_string()),
        port: config
            .service_http_port()
            .unwrap_or(DEFAULT_SERVICE_HTTP_PORT),
        target_port: Some(IntOrString::Int(HTTP_TARGET_PORT)),
        node_port: config
            .is_http_node_port_configured()
            .then(|| config.service_http_node_port())
            .flatten(),
        ..Default::default()
    };

    let edge_port = ServicePort {
        name: Some("edge".to_string()),
        port: config
            .service_edge_port()
            .unwrap_or(DEFAULT_SERVICE_EDGE_PORT),
        target_port: Some(IntOrString::Int(EDGE_TARGET_PORT)),
        node_port: config
            .is_edge_node_port_configured()
            .then(|| config.service_edge_node_port())
            .flatten(),
        ..Default::default()
    };

    let selector = BTreeMap::from([("app.kubernetes.io/name".to_string(), app_name.to_string())]);

    let spec = ServiceSpec {
        type_: Some(service_type.to_string()),
        ports: Some(vec![http_port, edge_port]),
        selector: Some(selector),
        ..Default::default()
    };
    debug!("generated service spec: {:?}", spec);
    spec
}

/// Delete then create the dashboard Service from the given configuration.
///
/// An existing Service is removed first, tolerating its absence, so the
/// resulting object always matches the configuration exactly rather than
/// accumulating fields from earlier versions.
pub async fn create_service(
    client: &Client,
    namespace: &str,
    app_name: &str,
    config: &PortainerConfig,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);

    match api.delete(app_name, &DeleteParams::default()).await {
        Ok(_) => info!("deleted existing service {}", app_name),
        Err(e) if is_not_found(&e) => {
            info!("{} service doesn't exist, skip deletion", app_name)
        }
        Err(e) => return Err(e.into()),
    }

    let service = Service {
        metadata: ObjectMeta {
            name: Some(app_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(service_labels(app_name)),
            ..Default::default()
        },
        spec: Some(build_service_spec(app_name, config)),
        ..Default::default()
    };

    api.create(&PostParams::default(), &service).await?;
    info!("created service {}", app_name);
    Ok(())
}

/// Patch the dashboard Service in place from the given configuration.
///
/// A plain replacement of `/spec` does not work: the live object carries
/// server-populated fields (clusterIP, ipFamilies) that a rebuilt spec
/// misses, and a null value in a patch body is rejected as "cannot unset".
/// So the built spec is serialized, stripped of nulls, and applied as one
/// whole-field replace operation per surviving top-level key. Out-of-band
/// edits to individual port entries are clobbered on the next patch; nested
/// diffing is deliberately not attempted.
pub async fn patch_service(
    client: &Client,
    namespace: &str,
    app_name: &str,
    config: &PortainerConfig,
) -> Result<()> {
    info!("updating service {} from config", app_name);
    let operations = build_patch_operations(&build_service_spec(app_name, config))?;
    if operations.is_empty() {
        info!("nothing to patch, skip patching");
        return Ok(());
    }
    debug!("patching service with operations: {:?}", operations);

    let patch: json_patch::Patch = serde_json::from_value(Value::Array(operations))?;
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    api.patch(app_name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await?;
    Ok(())
}

/// Build one `replace` operation per non-null top-level spec field.
pub fn build_patch_operations(spec: &ServiceSpec) -> Result<Vec<Value>> {
    let cleaned = clean_nones(serde_json::to_value(spec)?);
    let Value::Object(fields) = cleaned else {
        return Ok(Vec::new());
    };
    Ok(fields
        .into_iter()
        .map(|(key, value)| {
            json!({
                "op": "replace",
                "path": format!("/spec/{}", key),
                "value": value,
            })
        })
        .collect())
}

/// Recursively remove null values from objects and arrays.
pub fn clean_nones(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(clean_nones)
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, clean_nones(v)))
                .collect(),
        ),
        other => other,
    }
}
