use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::datastore::DatastoreRegistry;
use crate::errors::MediaError;
use crate::ids::IdGenerator;
use crate::store::MediaStore;

/// A stored piece of media addressed by `(owner_domain, media_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub owner_domain: String,
    pub media_id: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub datastore_id: String,
    pub location: String,
}

/// Sniffs the content type of uploaded data.
pub fn guess_content_type(data: &[u8]) -> String {
    use image::ImageFormat;

    match image::guess_format(data) {
        Ok(ImageFormat::Png) => mime::IMAGE_PNG.to_string(),
        Ok(ImageFormat::Jpeg) => mime::IMAGE_JPEG.to_string(),
        Ok(ImageFormat::Gif) => mime::IMAGE_GIF.to_string(),
        Ok(ImageFormat::Bmp) => mime::IMAGE_BMP.to_string(),
        Ok(ImageFormat::WebP) => "image/webp".to_string(),
        Ok(ImageFormat::Tiff) => "image/tiff".to_string(),
        Ok(ImageFormat::Ico) => "image/x-icon".to_string(),
        _ => mime::APPLICATION_OCTET_STREAM.to_string(),
    }
}

/// Resolves media references to their records and enforces size limits.
#[derive(Clone)]
pub struct MediaService {
    store: Arc<dyn MediaStore>,
    registry: Arc<DatastoreRegistry>,
    ids: IdGenerator,
    max_download_bytes: u64,
    max_upload_bytes: u64,
}

impl MediaService {
    pub fn new(
        store: Arc<dyn MediaStore>,
        registry: Arc<DatastoreRegistry>,
        ids: IdGenerator,
        max_download_bytes: u64,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            store,
            registry,
            ids,
            max_download_bytes,
            max_upload_bytes,
        }
    }

    /// Looks up a media record.
    ///
    /// Media larger than the download limit is refused with
    /// [`MediaError::TooLarge`].
    pub async fn get_media(&self, owner_domain: &str, media_id: &str) -> Result<MediaRecord, MediaError> {
        let record = self
            .store
            .get_media(owner_domain, media_id)
            .await?
            .ok_or(MediaError::NotFound)?;

        if record.size_bytes > self.max_download_bytes {
            return Err(MediaError::TooLarge {
                size: record.size_bytes,
                limit: self.max_download_bytes,
            });
        }

        Ok(record)
    }

    /// Reads the stored bytes of a media record.
    pub async fn download(&self, record: &MediaRecord) -> Result<Bytes, MediaError> {
        let data = self
            .registry
            .fetch(&record.datastore_id, &record.location)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "Media {}/{} is missing from datastore {} @ {}",
                    record.owner_domain,
                    record.media_id,
                    record.datastore_id,
                    record.location
                )
            })?;

        Ok(data)
    }

    /// Stores new media owned by the given domain.
    pub async fn upload(&self, owner_domain: &str, data: Bytes) -> Result<MediaRecord, MediaError> {
        let size = data.len() as u64;
        if size > self.max_upload_bytes {
            return Err(MediaError::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let media_id = self
            .ids
            .new_unique_id()
            .map_err(|e| anyhow!("Failed to generate media id: {}", e))?
            .to_media_id();

        let content_type = guess_content_type(&data);
        let stored = self.registry.store_bytes(data, &content_type).await?;

        let record = MediaRecord {
            owner_domain: owner_domain.to_string(),
            media_id,
            content_type,
            size_bytes: stored.size_bytes,
            datastore_id: stored.datastore_id,
            location: stored.location,
        };
        self.store.insert_media(record.clone()).await?;

        info!(
            server = %record.owner_domain,
            media_id = %record.media_id,
            size = record.size_bytes,
            "Stored new media"
        );

        Ok(record)
    }
}
