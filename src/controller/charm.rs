//! Charm orchestration
//!
//! [`Charm`] owns the persisted state and sequences the two resource
//! managers in response to lifecycle events. Each handler runs to completion
//! or to a defer point; a deferred event is redelivered later by the
//! dispatcher. Persisted state is only replaced after every required side
//! effect for the event has succeeded, so it always reflects the last fully
//! applied configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::config::PortainerConfig;
use crate::controller::error::Result;
use crate::controller::state::{CharmStatus, StatusLog, WaitReason};
use crate::controller::store::{StateStore, StoredState, SCHEMA_VERSION};
use crate::health::HealthState;
use crate::pebble::{self, Pebble};
use crate::resources::ClusterResources;

/// Lifecycle events delivered to the charm.
#[derive(Clone, Debug, PartialEq)]
pub enum CharmEvent {
    /// First-time setup of cluster resources.
    Install,
    /// A new candidate configuration arrived.
    ConfigChanged(PortainerConfig),
    /// The workload container's supervisor reported ready.
    PebbleReady,
    /// The operator binary was upgraded.
    UpgradeCharm,
    /// The application is being removed.
    Remove,
}

impl CharmEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CharmEvent::Install => "install",
            CharmEvent::ConfigChanged(_) => "config-changed",
            CharmEvent::PebbleReady => "pebble-ready",
            CharmEvent::UpgradeCharm => "upgrade-charm",
            CharmEvent::Remove => "remove",
        }
    }
}

/// What the dispatcher should do with the event after handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The event is done; drop it.
    Completed,
    /// A precondition was unmet; redeliver the event later.
    Deferred,
}

/// The orchestrator: persisted state plus the two resource managers.
pub struct Charm<C, P, S> {
    app_name: String,
    leader: Arc<AtomicBool>,
    cluster: C,
    pebble: P,
    store: S,
    state: StoredState,
    status: StatusLog,
    health: Option<Arc<HealthState>>,
}

impl<C, P, S> Charm<C, P, S>
where
    C: ClusterResources,
    P: Pebble,
    S: StateStore,
{
    pub fn new(
        app_name: impl Into<String>,
        leader: Arc<AtomicBool>,
        cluster: C,
        pebble: P,
        store: S,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            leader,
            cluster,
            pebble,
            store,
            state: StoredState::initial(),
            status: StatusLog::new(),
            health,
        }
    }

    /// Load persisted state, writing the defaults on first initialization.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.store.load().await? {
            Some(state) => {
                info!(schema_version = state.schema_version, "loaded persisted state");
                self.state = state;
            }
            None => {
                let state = StoredState::initial();
                self.store.save(&state).await?;
                info!("persisted initial state");
                self.state = state;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> CharmStatus {
        self.status.current()
    }

    pub fn stored_config(&self) -> &PortainerConfig {
        &self.state.config
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn set_status(&mut self, status: CharmStatus) {
        self.status.set(status);
        if let Some(health) = &self.health {
            health.set_ready(status.is_ready()).await;
            health.set_status(&status.to_string()).await;
        }
    }

    /// Dispatch an event to its handler.
    ///
    /// One row per event kind; every handler takes the current state and the
    /// collaborators and reports whether the event completed or must be
    /// redelivered.
    #[instrument(skip(self, event), fields(event = event.kind()))]
    pub async fn handle(&mut self, event: &CharmEvent) -> Result<Disposition> {
        match event {
            CharmEvent::Install => self.on_install().await,
            CharmEvent::ConfigChanged(candidate) => self.on_config_changed(candidate).await,
            CharmEvent::PebbleReady => self.on_pebble_ready().await,
            CharmEvent::UpgradeCharm => self.on_upgrade().await,
            CharmEvent::Remove => self.on_remove().await,
        }
    }

    /// Create the cluster resources for a fresh install.
    ///
    /// Cluster-wide objects are only written by the leader; everything else
    /// defers until leadership and permissions are in place.
    async fn on_install(&mut self) -> Result<Disposition> {
        if !self.is_leader() {
            warn!("unit is not the leader, deferring install");
            self.set_status(CharmStatus::Waiting(WaitReason::NoLeadership))
                .await;
            return Ok(Disposition::Deferred);
        }
        if !self.cluster.authenticate().await? {
            self.set_status(CharmStatus::Waiting(WaitReason::AuthDenied))
                .await;
            return Ok(Disposition::Deferred);
        }
        self.set_status(CharmStatus::Installing).await;
        info!("creating kubernetes resources");
        self.cluster
            .create_service(&self.app_name, &self.state.config)
            .await?;
        if !self.cluster.create_service_account(&self.app_name).await? {
            self.set_status(CharmStatus::Waiting(WaitReason::RbacMissing))
                .await;
            return Ok(Disposition::Deferred);
        }
        Ok(Disposition::Completed)
    }

    /// Apply a candidate configuration.
    ///
    /// The candidate is validated first; only a valid candidate is compared
    /// against the persisted configuration to decide which side effects to
    /// run. The Service side runs before the CLI side, and the first unmet
    /// precondition defers the whole event with nothing persisted.
    async fn on_config_changed(&mut self, candidate: &PortainerConfig) -> Result<Disposition> {
        let errors = candidate.validate();
        if !errors.is_empty() {
            warn!(?errors, "invalid configuration, deferring");
            self.set_status(CharmStatus::Waiting(WaitReason::InvalidConfig))
                .await;
            return Ok(Disposition::Deferred);
        }

        let changes = self.state.config.compare(candidate);
        info!(
            service_changed = changes.service_changed,
            cli_changed = changes.cli_changed,
            "classified configuration changes"
        );

        if changes.service_changed {
            if !self.cluster.authenticate().await? {
                self.set_status(CharmStatus::Waiting(WaitReason::AuthDenied))
                    .await;
                return Ok(Disposition::Deferred);
            }
            self.cluster
                .patch_service(&self.app_name, candidate)
                .await?;
        }

        if changes.cli_changed
            && !pebble::update_service(&self.pebble, candidate).await?
        {
            self.set_status(CharmStatus::Waiting(WaitReason::ContainerUnreachable))
                .await;
            return Ok(Disposition::Deferred);
        }

        self.state.config = self.state.config.merge(candidate);
        self.store.save(&self.state).await?;
        self.set_status(CharmStatus::Active).await;
        Ok(Disposition::Completed)
    }

    /// Start the workload once its supervisor is reachable.
    async fn on_pebble_ready(&mut self) -> Result<Disposition> {
        if !pebble::start_service(&self.pebble, &self.state.config).await? {
            self.set_status(CharmStatus::Waiting(WaitReason::ContainerUnreachable))
                .await;
            return Ok(Disposition::Deferred);
        }
        self.set_status(CharmStatus::Active).await;
        Ok(Disposition::Completed)
    }

    /// Reconcile the persisted schema version with this binary's.
    ///
    /// A downgrade is logged and otherwise ignored; a forward upgrade is the
    /// extension point for future state migrations.
    async fn on_upgrade(&mut self) -> Result<Disposition> {
        let stored = self.state.schema_version;
        if stored > SCHEMA_VERSION {
            error!(
                stored_version = stored,
                binary_version = SCHEMA_VERSION,
                "state was written by a newer version, downgrade is not supported"
            );
            return Ok(Disposition::Completed);
        }
        if stored < SCHEMA_VERSION {
            // No migrations exist yet; just record the new version.
            info!(
                from = stored,
                to = SCHEMA_VERSION,
                "upgrading persisted state schema"
            );
            self.state.schema_version = SCHEMA_VERSION;
            self.store.save(&self.state).await?;
        }
        Ok(Disposition::Completed)
    }

    /// Tear down everything the operator created.
    async fn on_remove(&mut self) -> Result<Disposition> {
        if !self.is_leader() {
            warn!("unit is not the leader, deferring removal");
            self.set_status(CharmStatus::Waiting(WaitReason::NoLeadership))
                .await;
            return Ok(Disposition::Deferred);
        }
        if !self.cluster.authenticate().await? {
            self.set_status(CharmStatus::Waiting(WaitReason::AuthDenied))
                .await;
            return Ok(Disposition::Deferred);
        }
        self.cluster.delete_resources(&self.app_name).await?;
        Ok(Disposition::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CONFIG_SERVICE_EDGE_NODE_PORT, CONFIG_SERVICE_EDGE_PORT, CONFIG_SERVICE_HTTP_PORT,
        CONFIG_SERVICE_TYPE,
    };
    use crate::controller::store::MemoryStore;
    use crate::pebble::MockPebble;
    use crate::resources::MockClusterResources;
    use serde_json::json;

    const APP: &str = "portainer";

    fn leader(flag: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(flag))
    }

    fn charm(
        is_leader: bool,
        cluster: MockClusterResources,
        pebble: MockPebble,
    ) -> Charm<MockClusterResources, MockPebble, MemoryStore> {
        Charm::new(APP, leader(is_leader), cluster, pebble, MemoryStore::new(), None)
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
    async fn test_initialize_persists_defaults_once() {
        let store = MemoryStore::new();
        let mut charm = Charm::new(
            APP,
            leader(true),
            MockClusterResources::new(),
            MockPebble::new(),
            store,
            None,
        );
        charm.initialize().await.unwrap();
        assert_eq!(charm.state, StoredState::initial());
        assert!(charm.stored_config().validate().is_empty());
    }

    #[tokio::test]
    async fn test_install_not_leader_makes_no_cluster_calls() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().never();
        cluster.expect_create_service().never();
        cluster.expect_create_service_account().never();

        let mut charm = charm(false, cluster, MockPebble::new());
        let disposition = charm.handle(&CharmEvent::Install).await.unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(
            charm.status(),
            CharmStatus::Waiting(WaitReason::NoLeadership)
        );
    }

    #[tokio::test]
    async fn test_install_auth_denied_defers_before_resource_creation() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(false));
        cluster.expect_create_service().never();
        cluster.expect_create_service_account().never();

        let mut charm = charm(true, cluster, MockPebble::new());
        let disposition = charm.handle(&CharmEvent::Install).await.unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(charm.status(), CharmStatus::Waiting(WaitReason::AuthDenied));
    }

    #[tokio::test]
    async fn test_install_creates_service_then_account() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(true));
        cluster
            .expect_create_service()
            .withf(|name, _| name == APP)
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_create_service_account()
            .withf(|name| name == APP)
            .times(1)
            .returning(|_| Ok(true));

        let mut charm = charm(true, cluster, MockPebble::new());
        let disposition = charm.handle(&CharmEvent::Install).await.unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(charm.status(), CharmStatus::Installing);
    }

    #[tokio::test]
    async fn test_install_missing_cluster_role_defers_after_service_creation() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().returning(|| Ok(true));
        cluster
            .expect_create_service()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_create_service_account()
            .times(1)
            .returning(|_| Ok(false));

        let mut charm = charm(true, cluster, MockPebble::new());
        let disposition = charm.handle(&CharmEvent::Install).await.unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(charm.status(), CharmStatus::Waiting(WaitReason::RbacMissing));
    }

    #[tokio::test]
    async fn test_config_changed_invalid_candidate_defers_untouched() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().never();
        cluster.expect_patch_service().never();

        let mut charm = charm(true, cluster, MockPebble::new());
        charm.initialize().await.unwrap();
        let before = charm.stored_config().clone();

        let disposition = charm
            .handle(&CharmEvent::ConfigChanged(PortainerConfig::new(
                Default::default(),
            )))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(
            charm.status(),
            CharmStatus::Waiting(WaitReason::InvalidConfig)
        );
        assert_eq!(charm.stored_config(), &before);
        // Nothing was written back to the store either.
        assert_eq!(
            charm.store.load().await.unwrap(),
            Some(StoredState::initial())
        );
    }

    #[tokio::test]
    async fn test_config_changed_no_change_persists_without_side_effects() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().never();
        cluster.expect_patch_service().never();
        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().never();

        let mut charm = charm(true, cluster, pebble);
        charm.initialize().await.unwrap();

        let disposition = charm
            .handle(&CharmEvent::ConfigChanged(PortainerConfig::default()))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(charm.status(), CharmStatus::Active);
    }

    #[tokio::test]
    async fn test_config_changed_applies_both_side_effects_then_persists() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(true));
        cluster
            .expect_patch_service()
            .withf(|name, config| {
                name == APP && config.service_edge_node_port() == Some(30776)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().return_const(true);
        pebble
            .expect_add_layer()
            .withf(|_, layer| {
                layer.services["portainer"].command == "/portainer --tunnel-port 30776"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        pebble.expect_restart().times(1).returning(|_| Ok(()));

        let mut charm = charm(true, cluster, pebble);
        charm.initialize().await.unwrap();

        let disposition = charm
            .handle(&CharmEvent::ConfigChanged(node_port_candidate()))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(charm.status(), CharmStatus::Active);
        // Candidate keys override, absent keys are retained.
        assert_eq!(charm.stored_config().service_http_port(), Some(9000));
        assert_eq!(charm.stored_config().service_edge_node_port(), Some(30776));
        let persisted = charm.store.load().await.unwrap().unwrap();
        assert_eq!(&persisted.config, charm.stored_config());
    }

    #[tokio::test]
    async fn test_config_changed_auth_denied_skips_both_managers() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(false));
        cluster.expect_patch_service().never();
        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().never();
        pebble.expect_restart().never();

        let mut charm = charm(true, cluster, pebble);
        charm.initialize().await.unwrap();

        let disposition = charm
            .handle(&CharmEvent::ConfigChanged(node_port_candidate()))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(charm.status(), CharmStatus::Waiting(WaitReason::AuthDenied));
        // Persisted config still the default.
        assert_eq!(
            charm.store.load().await.unwrap(),
            Some(StoredState::initial())
        );
    }

    #[tokio::test]
    async fn test_config_changed_container_unreachable_defers_after_patch() {
        let stored = StoredState {
            config: node_port_candidate(),
            schema_version: SCHEMA_VERSION,
        };

        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(true));
        cluster
            .expect_patch_service()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().return_const(false);
        pebble.expect_add_layer().never();
        pebble.expect_restart().never();

        let mut charm = Charm::new(
            APP,
            leader(true),
            cluster,
            pebble,
            MemoryStore::with_state(stored.clone()),
            None,
        );
        charm.initialize().await.unwrap();

        let candidate = PortainerConfig::new(
            [
                (CONFIG_SERVICE_TYPE.to_string(), json!("ClusterIP")),
                (CONFIG_SERVICE_HTTP_PORT.to_string(), json!(9000)),
                (CONFIG_SERVICE_EDGE_PORT.to_string(), json!(8000)),
            ]
            .into(),
        );
        let disposition = charm
            .handle(&CharmEvent::ConfigChanged(candidate))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(
            charm.status(),
            CharmStatus::Waiting(WaitReason::ContainerUnreachable)
        );
        // Patch succeeded but the event deferred, so nothing was persisted.
        assert_eq!(charm.store.load().await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_pebble_ready_starts_service_and_activates() {
        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().return_const(true);
        pebble.expect_get_service().returning(|_| Ok(None));
        pebble.expect_add_layer().times(1).returning(|_, _| Ok(()));
        pebble.expect_start().times(1).returning(|_| Ok(()));

        let mut charm = charm(true, MockClusterResources::new(), pebble);
        charm.initialize().await.unwrap();

        let disposition = charm.handle(&CharmEvent::PebbleReady).await.unwrap();
        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(charm.status(), CharmStatus::Active);
    }

    #[tokio::test]
    async fn test_pebble_ready_unreachable_defers() {
        let mut pebble = MockPebble::new();
        pebble.expect_can_connect().return_const(false);

        let mut charm = charm(true, MockClusterResources::new(), pebble);
        let disposition = charm.handle(&CharmEvent::PebbleReady).await.unwrap();

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(
            charm.status(),
            CharmStatus::Waiting(WaitReason::ContainerUnreachable)
        );
    }

    #[tokio::test]
    async fn test_upgrade_downgrade_logs_and_leaves_state_alone() {
        let stored = StoredState {
            config: PortainerConfig::default(),
            schema_version: 999,
        };
        let mut charm = Charm::new(
            APP,
            leader(true),
            MockClusterResources::new(),
            MockPebble::new(),
            MemoryStore::with_state(stored.clone()),
            None,
        );
        charm.initialize().await.unwrap();

        let disposition = charm.handle(&CharmEvent::UpgradeCharm).await.unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(charm.state.schema_version, 999);
        assert_eq!(charm.store.load().await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_upgrade_forward_records_new_version() {
        let stored = StoredState {
            config: PortainerConfig::default(),
            schema_version: 0,
        };
        let mut charm = Charm::new(
            APP,
            leader(true),
            MockClusterResources::new(),
            MockPebble::new(),
            MemoryStore::with_state(stored),
            None,
        );
        charm.initialize().await.unwrap();

        charm.handle(&CharmEvent::UpgradeCharm).await.unwrap();

        assert_eq!(charm.state.schema_version, SCHEMA_VERSION);
        let persisted = charm.store.load().await.unwrap().unwrap();
        assert_eq!(persisted.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_remove_deletes_resources_when_leader_and_authed() {
        let mut cluster = MockClusterResources::new();
        cluster.expect_authenticate().times(1).returning(|| Ok(true));
        cluster
            .expect_delete_resources()
            .withf(|name| name == APP)
            .times(1)
            .returning(|_| Ok(()));

        let mut charm = charm(true, cluster, MockPebble::new());
        let disposition = charm.handle(&CharmEvent::Remove).await.unwrap();
        assert_eq!(disposition, Disposition::Completed);
    }
}
