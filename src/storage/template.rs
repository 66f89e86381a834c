use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// The kind of storage a datastore is backed by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatastoreKind {
    File,
    S3,
}

/// A non-fatal health check a backend runs once at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum StartupCheck {
    BucketExists,
    TempPathExists,
}

#[async_trait]
pub trait StorageBackend: Sync + Send + 'static {
    fn kind(&self) -> DatastoreKind;

    /// Persists the data and returns the location it can be fetched from.
    ///
    /// Locations are derived from the content so storing identical data
    /// twice yields the same location.
    async fn store(&self, data: Bytes, content_type: &str) -> anyhow::Result<String>;

    async fn fetch(&self, location: &str) -> anyhow::Result<Option<Bytes>>;

    async fn exists(&self, location: &str) -> anyhow::Result<bool>;

    async fn startup_checks(&self) -> Vec<(StartupCheck, anyhow::Result<()>)> {
        Vec::new()
    }
}
