use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::storage::{DatastoreKind, StorageBackend};

#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default = "crate::config::default_true")]
    /// Disabled datastores receive no new writes but remain readable.
    ///
    /// Defaults to `true`.
    pub enabled: bool,

    #[serde(flatten)]
    pub backend: BackendConfigs,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum BackendConfigs {
    File {
        directory: PathBuf,
    },
    S3 {
        endpoint: String,

        #[serde(default = "default_region")]
        region: String,

        bucket: String,

        #[serde(default)]
        access_key: Option<String>,

        #[serde(default)]
        secret_key: Option<String>,

        #[serde(default = "std::env::temp_dir")]
        /// A local scratch directory for the datastore.
        temp_path: PathBuf,
    },
}

impl BackendConfigs {
    pub fn kind(&self) -> DatastoreKind {
        match self {
            Self::File { .. } => DatastoreKind::File,
            Self::S3 { .. } => DatastoreKind::S3,
        }
    }

    /// The address of the storage this config points at.
    ///
    /// Two configs with the same kind and uri refer to the same datastore.
    pub fn uri(&self) -> String {
        match self {
            Self::File { directory } => directory.to_string_lossy().into_owned(),
            Self::S3 { endpoint, bucket, .. } => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                format!("s3://{}/{}", host, bucket)
            },
        }
    }

    /// Rebuilds a config from a persisted datastore where that is possible
    /// without any secrets.
    pub fn from_record(kind: DatastoreKind, uri: &str) -> Option<Self> {
        match kind {
            DatastoreKind::File => Some(Self::File {
                directory: PathBuf::from(uri),
            }),
            DatastoreKind::S3 => None,
        }
    }

    pub async fn connect(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match self {
            Self::File { directory } => {
                tokio::fs::create_dir_all(directory).await?;
                Ok(Arc::new(super::filesystem::FileSystemBackend::new(directory.clone())))
            },
            Self::S3 {
                endpoint,
                region,
                bucket,
                access_key,
                secret_key,
                temp_path,
            } => Ok(Arc::new(super::blob_storage::BlobStorageBackend::new(
                endpoint.clone(),
                region.clone(),
                bucket.clone(),
                access_key.clone(),
                secret_key.clone(),
                temp_path.clone(),
            )?)),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}
