//! Orchestration flow tests
//!
//! These drive the charm through its public API with recording fakes in
//! place of the cluster and the process supervisor, verifying the sequencing
//! contract: which collaborator calls each event makes, and that state is
//! only persisted once every required side effect succeeded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use portainer_operator::config::{
    CONFIG_SERVICE_EDGE_NODE_PORT, CONFIG_SERVICE_EDGE_PORT, CONFIG_SERVICE_HTTP_PORT,
    CONFIG_SERVICE_TYPE,
};
use portainer_operator::controller::{
    Charm, CharmEvent, CharmStatus, Disposition, MemoryStore, StateStore, StoredState, WaitReason,
};
use portainer_operator::pebble::{ClientError, Layer, Pebble, ServiceStatus, PEBBLE_SERVICE};
use portainer_operator::resources::ClusterResources;
use portainer_operator::{PortainerConfig, Result};

const APP: &str = "portainer";

/// Cluster fake that records every call it receives.
#[derive(Clone)]
struct FakeCluster {
    authed: Arc<AtomicBool>,
    rbac_ready: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeCluster {
    fn new(authed: bool, rbac_ready: bool) -> Self {
        Self {
            authed: Arc::new(AtomicBool::new(authed)),
            rbac_ready: Arc::new(AtomicBool::new(rbac_ready)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ClusterResources for FakeCluster {
    async fn authenticate(&self) -> Result<bool> {
        self.record("authenticate");
        Ok(self.authed.load(Ordering::SeqCst))
    }

    async fn create_service(&self, app_name: &str, _config: &PortainerConfig) -> Result<()> {
        self.record(&format!("create_service:{app_name}"));
        Ok(())
    }

    async fn patch_service(&self, app_name: &str, _config: &PortainerConfig) -> Result<()> {
        self.record(&format!("patch_service:{app_name}"));
        Ok(())
    }

    async fn create_service_account(&self, app_name: &str) -> Result<bool> {
        self.record(&format!("create_service_account:{app_name}"));
        Ok(self.rbac_ready.load(Ordering::SeqCst))
    }

    async fn delete_resources(&self, app_name: &str) -> Result<()> {
        self.record(&format!("delete_resources:{app_name}"));
        Ok(())
    }
}

/// Supervisor fake tracking the registered command and service state.
#[derive(Clone)]
struct FakePebble {
    reachable: Arc<AtomicBool>,
    registered: Arc<Mutex<Option<ServiceStatus>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakePebble {
    fn new(reachable: bool) -> Self {
        Self {
            reachable: Arc::new(AtomicBool::new(reachable)),
            registered: Arc::new(Mutex::new(None)),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pebble for FakePebble {
    async fn can_connect(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn get_service(&self, _name: &str) -> std::result::Result<Option<ServiceStatus>, ClientError> {
        Ok(self.registered.lock().unwrap().clone())
    }

    async fn add_layer(&self, _label: &str, layer: &Layer) -> std::result::Result<(), ClientError> {
        let command = layer.services[PEBBLE_SERVICE].command.clone();
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    async fn start(&self, name: &str) -> std::result::Result<(), ClientError> {
        *self.registered.lock().unwrap() = Some(ServiceStatus {
            name: name.to_string(),
            current: "active".to_string(),
        });
        Ok(())
    }

    async fn restart(&self, name: &str) -> std::result::Result<(), ClientError> {
        *self.registered.lock().unwrap() = Some(ServiceStatus {
            name: name.to_string(),
            current: "active".to_string(),
        });
        Ok(())
    }
}

/// Store handle that stays inspectable after the charm takes its clone.
#[derive(Clone, Default)]
struct SharedStore(Arc<MemoryStore>);

#[async_trait]
impl StateStore for SharedStore {
    async fn load(&self) -> Result<Option<StoredState>> {
        self.0.load().await
    }

    async fn save(&self, state: &StoredState) -> Result<()> {
        self.0.save(state).await
    }
}

fn build_charm(
    leader: bool,
    cluster: &FakeCluster,
    pebble: &FakePebble,
    store: &SharedStore,
) -> Charm<FakeCluster, FakePebble, SharedStore> {
    Charm::new(
        APP,
        Arc::new(AtomicBool::new(leader)),
        cluster.clone(),
        pebble.clone(),
        store.clone(),
        None,
    )
}

fn node_port_candidate() -> PortainerConfig {
    PortainerConfig::new(
        [
            (CONFIG_SERVICE_TYPE.to_string(), json!("NodePort")),
            (CONFIG_SERVICE_HTTP_PORT.to_string(), json!(9000)),
            (CONFIG_SERVICE_EDGE_PORT.to_string(), json!(8000)),
            (CONFIG_SERVICE_EDGE_NODE_PORT.to_string(), json!(30776)),
        ]
        .into(),
    )
}

#[tokio::test]
async fn install_then_start_reaches_active() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm.handle(&CharmEvent::Install).await.unwrap(),
        Disposition::Completed
    );
    assert_eq!(
        cluster.calls(),
        vec![
            "authenticate",
            "create_service:portainer",
            "create_service_account:portainer",
        ]
    );

    assert_eq!(
        charm.handle(&CharmEvent::PebbleReady).await.unwrap(),
        Disposition::Completed
    );
    assert_eq!(charm.status(), CharmStatus::Active);
    assert_eq!(pebble.commands(), vec!["/portainer"]);
}

#[tokio::test]
async fn install_without_leadership_makes_no_cluster_calls() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(false, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm.handle(&CharmEvent::Install).await.unwrap(),
        Disposition::Deferred
    );
    assert_eq!(
        charm.status(),
        CharmStatus::Waiting(WaitReason::NoLeadership)
    );
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn install_with_denied_auth_stops_before_resources() {
    let cluster = FakeCluster::new(false, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm.handle(&CharmEvent::Install).await.unwrap(),
        Disposition::Deferred
    );
    assert_eq!(charm.status(), CharmStatus::Waiting(WaitReason::AuthDenied));
    assert_eq!(cluster.calls(), vec!["authenticate"]);
}

#[tokio::test]
async fn config_change_into_node_port_runs_both_managers() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm
            .handle(&CharmEvent::ConfigChanged(node_port_candidate()))
            .await
            .unwrap(),
        Disposition::Completed
    );

    assert_eq!(
        cluster.calls(),
        vec!["authenticate", "patch_service:portainer"]
    );
    assert_eq!(pebble.commands(), vec!["/portainer --tunnel-port 30776"]);
    assert_eq!(charm.status(), CharmStatus::Active);

    let persisted = store.load().await.unwrap().expect("state persisted");
    assert_eq!(persisted.config.service_edge_node_port(), Some(30776));
}

#[tokio::test]
async fn config_change_is_not_persisted_when_container_unreachable() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(false);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();
    let initial = store.load().await.unwrap();

    assert_eq!(
        charm
            .handle(&CharmEvent::ConfigChanged(node_port_candidate()))
            .await
            .unwrap(),
        Disposition::Deferred
    );
    assert_eq!(
        charm.status(),
        CharmStatus::Waiting(WaitReason::ContainerUnreachable)
    );
    // The service patch ran, but the event deferred before persisting.
    assert_eq!(
        cluster.calls(),
        vec!["authenticate", "patch_service:portainer"]
    );
    assert!(pebble.commands().is_empty());
    assert_eq!(store.load().await.unwrap(), initial);
}

#[tokio::test]
async fn invalid_config_defers_without_touching_anything() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    let empty = PortainerConfig::new(Default::default());
    assert_eq!(
        charm.handle(&CharmEvent::ConfigChanged(empty)).await.unwrap(),
        Disposition::Deferred
    );
    assert_eq!(
        charm.status(),
        CharmStatus::Waiting(WaitReason::InvalidConfig)
    );
    assert!(cluster.calls().is_empty());
    assert!(pebble.commands().is_empty());
}

#[tokio::test]
async fn downgrade_is_ignored_and_state_untouched() {
    let store = SharedStore::default();
    store
        .save(&StoredState {
            config: PortainerConfig::default(),
            schema_version: 999,
        })
        .await
        .unwrap();

    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm.handle(&CharmEvent::UpgradeCharm).await.unwrap(),
        Disposition::Completed
    );
    let persisted = store.load().await.unwrap().unwrap();
    assert_eq!(persisted.schema_version, 999);
}

#[tokio::test]
async fn remove_deletes_created_resources() {
    let cluster = FakeCluster::new(true, true);
    let pebble = FakePebble::new(true);
    let store = SharedStore::default();
    let mut charm = build_charm(true, &cluster, &pebble, &store);
    charm.initialize().await.unwrap();

    assert_eq!(
        charm.handle(&CharmEvent::Remove).await.unwrap(),
        Disposition::Completed
    );
    assert_eq!(
        cluster.calls(),
        vec!["authenticate", "delete_resources:portainer"]
    );
}
