use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::datastore::Datastore;
use crate::media::MediaRecord;
use crate::thumbnail::{DerivationKey, ThumbnailRecord};

/// The durable record keeper for media, thumbnails and datastores.
#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    async fn get_media(&self, owner_domain: &str, media_id: &str) -> Result<Option<MediaRecord>>;

    /// Records new media, media records are never overwritten.
    async fn insert_media(&self, record: MediaRecord) -> Result<()>;

    async fn get_thumbnail(&self, key: &DerivationKey) -> Result<Option<ThumbnailRecord>>;

    /// Records a derived thumbnail.
    ///
    /// If a thumbnail already exists for the same key the existing record
    /// is kept and returned.
    async fn insert_thumbnail(&self, record: ThumbnailRecord) -> Result<ThumbnailRecord>;

    async fn get_datastore(&self, datastore_id: &str) -> Result<Option<Datastore>>;

    async fn upsert_datastore(&self, datastore: Datastore) -> Result<()>;

    /// Every known datastore ordered by id.
    async fn get_all_datastores(&self) -> Result<Vec<Datastore>>;
}

#[derive(Default)]
struct Tables {
    media: HashMap<(String, String), MediaRecord>,
    thumbnails: HashMap<DerivationKey, ThumbnailRecord>,
    datastores: HashMap<String, Datastore>,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    media: Vec<MediaRecord>,
    thumbnails: Vec<ThumbnailRecord>,
    datastores: Vec<Datastore>,
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            media: snapshot
                .media
                .into_iter()
                .map(|r| ((r.owner_domain.clone(), r.media_id.clone()), r))
                .collect(),
            thumbnails: snapshot
                .thumbnails
                .into_iter()
                .map(|r| (r.key(), r))
                .collect(),
            datastores: snapshot
                .datastores
                .into_iter()
                .map(|ds| (ds.id.clone(), ds))
                .collect(),
        }
    }
}

impl Tables {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            media: self.media.values().cloned().collect(),
            thumbnails: self.thumbnails.values().cloned().collect(),
            datastores: self.datastores.values().cloned().collect(),
        }
    }
}

/// An in memory media store which optionally persists every write to a
/// JSON file.
#[derive(Default)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Opens the store, loading any existing records from the given path.
    pub async fn open(path: Option<PathBuf>) -> Result<Self> {
        let tables = match path.as_ref() {
            None => Tables::default(),
            Some(path) => match tokio::fs::read(path).await {
                Ok(data) => serde_json::from_slice::<Snapshot>(&data)
                    .with_context(|| format!("Failed to parse media store {:?}", path))?
                    .into(),
                Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
                Err(other) => return Err(other.into()),
            },
        };

        if let Some(path) = path.as_ref() {
            info!("Media store persisting to {:?}", path);
        }

        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let path = match self.path.as_ref() {
            None => return Ok(()),
            Some(path) => path,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(&tables.snapshot())?;
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, path).await?;

        Ok(())
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn get_media(&self, owner_domain: &str, media_id: &str) -> Result<Option<MediaRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .media
            .get(&(owner_domain.to_string(), media_id.to_string()))
            .cloned())
    }

    async fn insert_media(&self, record: MediaRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = (record.owner_domain.clone(), record.media_id.clone());
        if tables.media.contains_key(&key) {
            return Err(anyhow!(
                "Media {}/{} already exists",
                record.owner_domain,
                record.media_id
            ));
        }

        tables.media.insert(key.clone(), record);
        if let Err(e) = self.persist(&tables).await {
            tables.media.remove(&key);
            return Err(e);
        }

        Ok(())
    }

    async fn get_thumbnail(&self, key: &DerivationKey) -> Result<Option<ThumbnailRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.thumbnails.get(key).cloned())
    }

    async fn insert_thumbnail(&self, record: ThumbnailRecord) -> Result<ThumbnailRecord> {
        let mut tables = self.tables.write().await;
        let key = record.key();
        if let Some(existing) = tables.thumbnails.get(&key) {
            return Ok(existing.clone());
        }

        tables.thumbnails.insert(key.clone(), record.clone());
        if let Err(e) = self.persist(&tables).await {
            tables.thumbnails.remove(&key);
            return Err(e);
        }

        Ok(record)
    }

    async fn get_datastore(&self, datastore_id: &str) -> Result<Option<Datastore>> {
        let tables = self.tables.read().await;
        Ok(tables.datastores.get(datastore_id).cloned())
    }

    async fn upsert_datastore(&self, datastore: Datastore) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.datastores.get(&datastore.id) == Some(&datastore) {
            return Ok(());
        }

        let id = datastore.id.clone();
        let previous = tables.datastores.insert(id.clone(), datastore);
        if let Err(e) = self.persist(&tables).await {
            match previous {
                Some(previous) => tables.datastores.insert(id, previous),
                None => tables.datastores.remove(&id),
            };
            return Err(e);
        }

        Ok(())
    }

    async fn get_all_datastores(&self) -> Result<Vec<Datastore>> {
        let tables = self.tables.read().await;
        let mut datastores: Vec<Datastore> = tables.datastores.values().cloned().collect();
        datastores.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(datastores)
    }
}
