pub mod config;
pub mod controller;
pub mod health;
pub mod pebble;
pub mod resources;

pub use config::{ChangeSet, PortainerConfig, ServiceType};
pub use controller::{
    BackoffConfig, Charm, CharmEvent, CharmStatus, ConfigMapStore, Disposition, Envelope, Error,
    MemoryStore, Result, StateStore, StoredState, WaitReason, SCHEMA_VERSION,
};
pub use health::{run_health_server, HealthState, Metrics};
pub use pebble::{Pebble, PebbleClient};
pub use resources::{ClusterResources, KubeClusterResources};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use controller::dispatcher::{self, event_channel};
use pebble::CONTAINER_NAME;

/// Run the operator against the namespace the pod runs in.
///
/// Reads the namespace from the mounted ServiceAccount token and then runs
/// the event loop until shutdown. The leader flag is maintained externally
/// (see `main.rs`); handlers only consult it.
pub async fn run_operator(
    client: Client,
    app_name: &str,
    is_leader: Arc<AtomicBool>,
    health: Option<Arc<HealthState>>,
) -> Result<()> {
    let namespace = resources::read_namespace()?;
    run_operator_scoped(client, app_name, &namespace, is_leader, health).await
}

/// Run the operator with an explicit namespace.
///
/// Split out so tests and local runs can scope the operator without the
/// in-cluster namespace file.
pub async fn run_operator_scoped(
    client: Client,
    app_name: &str,
    namespace: &str,
    is_leader: Arc<AtomicBool>,
    health: Option<Arc<HealthState>>,
) -> Result<()> {
    info!(app_name, namespace, "starting charm event loop");

    let cluster = KubeClusterResources::new(client.clone(), namespace);
    let pebble = PebbleClient::for_container(CONTAINER_NAME);
    let store = ConfigMapStore::new(client.clone(), namespace, format!("{app_name}-state"));
    let mut charm = Charm::new(
        app_name,
        is_leader,
        cluster,
        pebble,
        store,
        health.clone(),
    );
    charm.initialize().await?;

    let (tx, mut rx) = event_channel();

    // Seed the lifecycle. The version check runs before anything acts on the
    // persisted state; install is delete-then-recreate and safe to repeat.
    for event in [
        CharmEvent::UpgradeCharm,
        CharmEvent::Install,
        CharmEvent::PebbleReady,
    ] {
        let _ = tx.send(Envelope::new(event));
    }

    // The configuration surface is a ConfigMap; its initial listing and
    // every later modification arrive as config-changed events.
    let config_map = format!("{app_name}-config");
    let watch_client = client.clone();
    let watch_namespace = namespace.to_string();
    let watch_tx = tx.clone();
    tokio::spawn(async move {
        watch_config(watch_client, &watch_namespace, &config_map, watch_tx).await;
    });

    dispatcher::run(&mut charm, &mut rx, tx, BackoffConfig::default(), health).await;
    Ok(())
}

/// Watch the configuration ConfigMap and emit config-changed events.
async fn watch_config(
    client: Client,
    namespace: &str,
    name: &str,
    tx: UnboundedSender<Envelope>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let mut stream = std::pin::pin!(watcher(api, config).default_backoff().applied_objects());

    loop {
        match stream.try_next().await {
            Ok(Some(cm)) => {
                let candidate = PortainerConfig::from_str_map(cm.data.unwrap_or_default());
                info!(config = %candidate, "configuration changed");
                if tx
                    .send(Envelope::new(CharmEvent::ConfigChanged(candidate)))
                    .is_err()
                {
                    // Dispatcher is gone; we are shutting down.
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => warn!(error = %e, "config watch error, retrying"),
        }
    }
}
