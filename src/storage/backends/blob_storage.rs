use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use rusoto_core::credential::{DefaultCredentialsProvider, StaticProvider};
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_s3::{
    GetObjectError,
    GetObjectRequest,
    HeadBucketRequest,
    HeadObjectError,
    HeadObjectRequest,
    PutObjectRequest,
    S3Client,
    S3,
};

use crate::storage::{DatastoreKind, StartupCheck, StorageBackend};
use crate::utils::{content_hash, sharded_location};

pub struct BlobStorageBackend {
    client: S3Client,
    bucket: String,
    temp_path: PathBuf,
}

impl BlobStorageBackend {
    pub fn new(
        endpoint: String,
        region: String,
        bucket: String,
        access_key: Option<String>,
        secret_key: Option<String>,
        temp_path: PathBuf,
    ) -> Result<Self> {
        let region = Region::Custom {
            name: region,
            endpoint,
        };
        let http = HttpClient::new()?;

        let client = match (access_key, secret_key) {
            (Some(access_key), Some(secret_key)) => S3Client::new_with(
                http,
                StaticProvider::new_minimal(access_key, secret_key),
                region,
            ),
            _ => S3Client::new_with(http, DefaultCredentialsProvider::new()?, region),
        };

        Ok(Self {
            client,
            bucket,
            temp_path,
        })
    }

    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        let request = HeadBucketRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        self.client
            .head_bucket(request)
            .await
            .map_err(|e| anyhow!("Bucket {:?} is not reachable: {}", &self.bucket, e))
    }

    pub async fn ensure_temp_path_exists(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.temp_path).await?;
        if !meta.is_dir() {
            return Err(anyhow!("Temporary path {:?} is not a directory", &self.temp_path));
        }

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for BlobStorageBackend {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::S3
    }

    async fn store(&self, data: Bytes, content_type: &str) -> Result<String> {
        let location = sharded_location(&content_hash(&data));
        if self.exists(&location).await? {
            debug!("Content already stored in bucket @ {}", &location);
            return Ok(location);
        }

        debug!("Storing content in bucket @ {}", &location);
        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: location.clone(),
            content_length: Some(data.len() as i64),
            content_type: Some(content_type.to_string()),
            body: Some(data.to_vec().into()),
            ..Default::default()
        };
        self.client.put_object(request).await?;

        Ok(location)
    }

    async fn fetch(&self, location: &str) -> Result<Option<Bytes>> {
        debug!("Retrieving content in bucket @ {}", location);
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: location.to_string(),
            ..Default::default()
        };

        let output = match self.client.get_object(request).await {
            Ok(output) => output,
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => return Ok(None),
            Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => {
                return Ok(None)
            },
            Err(other) => return Err(other.into()),
        };

        let body = output
            .body
            .ok_or_else(|| anyhow!("Remote storage bucket returned no body for {}", location))?;

        let buffer = body
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;

        Ok(Some(buffer.freeze()))
    }

    async fn exists(&self, location: &str) -> Result<bool> {
        let request = HeadObjectRequest {
            bucket: self.bucket.clone(),
            key: location.to_string(),
            ..Default::default()
        };

        match self.client.head_object(request).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(HeadObjectError::NoSuchKey(_))) => Ok(false),
            Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => Ok(false),
            Err(other) => Err(other.into()),
        }
    }

    async fn startup_checks(&self) -> Vec<(StartupCheck, Result<()>)> {
        vec![
            (StartupCheck::BucketExists, self.ensure_bucket_exists().await),
            (StartupCheck::TempPathExists, self.ensure_temp_path_exists().await),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(temp_path: PathBuf) -> Result<BlobStorageBackend> {
        BlobStorageBackend::new(
            "http://127.0.0.1:9".to_string(),
            "us-east-1".to_string(),
            "media".to_string(),
            Some("access".to_string()),
            Some("secret".to_string()),
            temp_path,
        )
    }

    #[tokio::test]
    async fn test_temp_path_check() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let present = backend(dir.path().to_path_buf())?;
        assert!(present.ensure_temp_path_exists().await.is_ok());

        let missing = backend(dir.path().join("missing"))?;
        assert!(missing.ensure_temp_path_exists().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_kind_is_s3() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(backend(dir.path().to_path_buf())?.kind(), DatastoreKind::S3);
        Ok(())
    }
}
