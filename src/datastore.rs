use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::cache::ObjectCache;
use crate::storage::backends::{BackendConfigs, DatastoreConfig};
use crate::storage::{DatastoreKind, StorageBackend};
use crate::store::MediaStore;

/// A storage backend instance known to the repository.
///
/// Records outlive their configuration so media stored in a datastore
/// which is later removed from the config can still be located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: DatastoreKind,

    pub uri: String,

    pub enabled: bool,
}

/// Derives the id for a datastore from its kind and uri.
pub fn datastore_id(kind: DatastoreKind, uri: &str) -> String {
    format!("{:08x}", crate::utils::crc_hash((kind.as_ref(), uri)))
}

/// Collapses configs which point at the same storage.
///
/// The first config for a `(kind, uri)` pair wins, a pair is enabled if
/// any of its configs are.
pub fn unique_datastores(configs: &[DatastoreConfig]) -> Vec<DatastoreConfig> {
    let mut unique: Vec<DatastoreConfig> = Vec::with_capacity(configs.len());

    for cfg in configs {
        let kind = cfg.backend.kind();
        let uri = cfg.backend.uri();

        let existing = unique
            .iter_mut()
            .find(|ds| ds.backend.kind() == kind && ds.backend.uri() == uri);

        match existing {
            Some(existing) => existing.enabled |= cfg.enabled,
            None => unique.push(cfg.clone()),
        }
    }

    unique
}

/// Constructs live backend instances from their config.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, cfg: &BackendConfigs) -> Result<Arc<dyn StorageBackend>>;
}

#[derive(Default)]
pub struct ConfigConnector;

#[async_trait]
impl Connector for ConfigConnector {
    async fn connect(&self, cfg: &BackendConfigs) -> Result<Arc<dyn StorageBackend>> {
        cfg.connect().await
    }
}

type InstanceKey = (DatastoreKind, String);
type InstanceSlot = Arc<OnceCell<Arc<dyn StorageBackend>>>;

/// A stored object and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub datastore_id: String,
    pub location: String,
    pub size_bytes: u64,
}

/// Owns every live backend instance, at most one per `(kind, uri)`.
pub struct DatastoreRegistry {
    configs: Vec<DatastoreConfig>,
    store: Arc<dyn MediaStore>,
    connector: Arc<dyn Connector>,
    instances: Mutex<HashMap<InstanceKey, InstanceSlot>>,
    cache: ObjectCache,
}

impl DatastoreRegistry {
    pub fn new(configs: &[DatastoreConfig], store: Arc<dyn MediaStore>, cache: ObjectCache) -> Self {
        Self::with_connector(configs, store, cache, Arc::new(ConfigConnector))
    }

    pub fn with_connector(
        configs: &[DatastoreConfig],
        store: Arc<dyn MediaStore>,
        cache: ObjectCache,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            configs: unique_datastores(configs),
            store,
            connector,
            instances: Mutex::new(HashMap::new()),
            cache,
        }
    }

    #[inline]
    pub fn unique_datastores(&self) -> &[DatastoreConfig] {
        &self.configs
    }

    fn config_for(&self, kind: DatastoreKind, uri: &str) -> Option<(BackendConfigs, bool)> {
        self.configs
            .iter()
            .find(|cfg| cfg.backend.kind() == kind && cfg.backend.uri() == uri)
            .map(|cfg| (cfg.backend.clone(), cfg.enabled))
            .or_else(|| BackendConfigs::from_record(kind, uri).map(|cfg| (cfg, false)))
    }

    fn slot(&self, kind: DatastoreKind, uri: &str) -> Result<InstanceSlot> {
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| anyhow!("Datastore registry lock poisoned"))?;

        let slot = instances
            .entry((kind, uri.to_string()))
            .or_insert_with(|| Arc::new(OnceCell::new()));

        Ok(slot.clone())
    }

    /// Gets the live backend for the given storage, constructing it on
    /// first use.
    ///
    /// Concurrent callers for the same storage share a single construction.
    /// A failed construction is not remembered.
    pub async fn backend(&self, kind: DatastoreKind, uri: &str) -> Result<Arc<dyn StorageBackend>> {
        let (cfg, _) = self.config_for(kind, uri).ok_or_else(|| {
            anyhow!("No configuration is available for {} datastore {}", kind, uri)
        })?;

        let slot = self.slot(kind, uri)?;
        let backend = slot
            .get_or_try_init(|| async {
                debug!("Constructing {} datastore backend for {}", kind, uri);
                self.connector.connect(&cfg).await
            })
            .await?;

        Ok(backend.clone())
    }

    /// Gets or creates the datastore for the given storage, ensuring its
    /// backend is constructed and the datastore is recorded.
    pub async fn get_or_create_datastore_of_type(
        &self,
        kind: DatastoreKind,
        uri: &str,
    ) -> Result<Datastore> {
        let (_, enabled) = self.config_for(kind, uri).ok_or_else(|| {
            anyhow!("No configuration is available for {} datastore {}", kind, uri)
        })?;

        self.backend(kind, uri).await?;

        let id = datastore_id(kind, uri);
        if let Some(existing) = self.store.get_datastore(&id).await? {
            if existing.enabled == enabled {
                return Ok(existing);
            }
        }

        let datastore = Datastore {
            id,
            kind,
            uri: uri.to_string(),
            enabled,
        };
        self.store.upsert_datastore(datastore.clone()).await?;

        Ok(datastore)
    }

    /// Every datastore ever recorded, including disabled and historical ones.
    pub async fn get_all_datastores(&self) -> Result<Vec<Datastore>> {
        self.store.get_all_datastores().await
    }

    /// The datastore new objects are written to.
    pub async fn write_target(&self) -> Result<Datastore> {
        let cfg = self
            .configs
            .iter()
            .find(|cfg| cfg.enabled)
            .ok_or_else(|| anyhow!("No enabled datastore is available for writes"))?;

        self.get_or_create_datastore_of_type(cfg.backend.kind(), &cfg.backend.uri())
            .await
    }

    async fn backend_for_id(&self, datastore_id: &str) -> Result<Arc<dyn StorageBackend>> {
        let datastore = self
            .store
            .get_datastore(datastore_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown datastore {}", datastore_id))?;

        self.backend(datastore.kind, &datastore.uri).await
    }

    /// Writes the data to the current write target.
    pub async fn store_bytes(&self, data: Bytes, content_type: &str) -> Result<StoredObject> {
        let datastore = self.write_target().await?;
        let backend = self.backend(datastore.kind, &datastore.uri).await?;

        let size_bytes = data.len() as u64;
        let location = backend.store(data.clone(), content_type).await?;
        self.cache.set(&datastore.id, &location, data).await;

        Ok(StoredObject {
            datastore_id: datastore.id,
            location,
            size_bytes,
        })
    }

    /// Reads an object from the datastore it was stored in.
    pub async fn fetch(&self, datastore_id: &str, location: &str) -> Result<Option<Bytes>> {
        if let Some(data) = self.cache.get(datastore_id, location) {
            return Ok(Some(data));
        }

        let backend = self.backend_for_id(datastore_id).await?;
        let data = backend.fetch(location).await?;
        if let Some(ref data) = data {
            self.cache.set(datastore_id, location, data.clone()).await;
        }

        Ok(data)
    }

    pub async fn exists(&self, datastore_id: &str, location: &str) -> Result<bool> {
        let backend = self.backend_for_id(datastore_id).await?;
        backend.exists(location).await
    }
}
