//! Persisted charm state
//!
//! The charm persists exactly two things: the last successfully applied
//! configuration and a schema version marker for upgrade handling. The
//! production store keeps them in a ConfigMap so they survive restarts; the
//! in-memory store backs tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde::{Deserialize, Serialize};

use crate::config::PortainerConfig;
use crate::controller::error::{is_not_found, Error, Result};
use crate::resources::common::FIELD_MANAGER;

/// Version of the persisted state schema written by this binary.
pub const SCHEMA_VERSION: u32 = 1;

const CONFIG_KEY: &str = "config";
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Everything the charm persists across restarts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub config: PortainerConfig,
    pub schema_version: u32,
}

impl StoredState {
    /// State written at first initialization.
    pub fn initial() -> Self {
        Self {
            config: PortainerConfig::default(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Key/value persistence for the charm's state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted state, `None` before first initialization.
    async fn load(&self) -> Result<Option<StoredState>>;

    /// Persist the state atomically.
    async fn save(&self, state: &StoredState) -> Result<()>;
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Option<StoredState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoredState) -> Self {
        Self {
            inner: Mutex::new(Some(state)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<StoredState>> {
        Ok(self.inner.lock().expect("store poisoned").clone())
    }

    async fn save(&self, state: &StoredState) -> Result<()> {
        *self.inner.lock().expect("store poisoned") = Some(state.clone());
        Ok(())
    }
}

/// ConfigMap-backed store: one ConfigMap in the charm's namespace holding
/// the serialized config and the schema version.
#[derive(Clone)]
pub struct ConfigMapStore {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl StateStore for ConfigMapStore {
    async fn load(&self) -> Result<Option<StoredState>> {
        let cm = match self.api().get(&self.name).await {
            Ok(cm) => cm,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = cm.data.unwrap_or_default();
        let config_json = data
            .get(CONFIG_KEY)
            .ok_or_else(|| Error::StateError(format!("{} missing key {}", self.name, CONFIG_KEY)))?;
        let config: PortainerConfig = serde_json::from_str(config_json)?;
        let schema_version = data
            .get(SCHEMA_VERSION_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::StateError(format!("{} missing key {}", self.name, SCHEMA_VERSION_KEY))
            })?;
        Ok(Some(StoredState {
            config,
            schema_version,
        }))
    }

    async fn save(&self, state: &StoredState) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (CONFIG_KEY.to_string(), serde_json::to_string(&state.config)?),
                (
                    SCHEMA_VERSION_KEY.to_string(),
                    state.schema_version.to_string(),
                ),
            ])),
            ..Default::default()
        };
        self.api()
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;
        Ok(())
    }
}
