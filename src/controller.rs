use std::sync::Arc;

use bytes::Bytes;
use poem_openapi::Object;

use crate::datastore::DatastoreRegistry;
use crate::errors::{ErrorReporter, MediaError, ThumbnailError};
use crate::media::{MediaRecord, MediaService};
use crate::thumbnail::{ThumbnailRequest, ThumbnailService};

#[derive(Object, Debug)]
pub struct UploadInfo {
    /// The generated ID for the media.
    ///
    /// This is unique within the owning server.
    pub media_id: String,

    /// The `mxc://` uri the media can be referenced by.
    pub content_uri: String,

    /// The size of the stored media in bytes.
    pub size_bytes: u64,

    /// The content type the media was detected as.
    pub content_type: String,
}

/// Bytes ready to be sent back to the caller.
#[derive(Debug)]
pub struct ServedMedia {
    pub content_type: String,
    pub data: Bytes,

    /// Set when the original media is served in place of a thumbnail.
    pub fallback: bool,
}

/// The caller visible outcome of a failed request.
///
/// Internal details are never carried here, they are logged and
/// reported before this is produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ServeError {
    BadInput(String),
    NotFound,
    TooLarge(String),
    Internal,
}

pub struct MediaController {
    media: MediaService,
    thumbnails: ThumbnailService,
    registry: Arc<DatastoreRegistry>,
    reporter: Arc<dyn ErrorReporter>,
}

impl MediaController {
    pub fn new(
        media: MediaService,
        thumbnails: ThumbnailService,
        registry: Arc<DatastoreRegistry>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            media,
            thumbnails,
            registry,
            reporter,
        }
    }

    #[inline]
    pub fn registry(&self) -> &DatastoreRegistry {
        &self.registry
    }

    fn internal(&self, err: &anyhow::Error, context: &[(&str, &str)]) -> ServeError {
        self.reporter.capture(err, context);
        ServeError::Internal
    }

    fn resolve(&self, server: &str, media_id: &str, res: Result<MediaRecord, MediaError>) -> Result<MediaRecord, ServeError> {
        match res {
            Ok(record) => Ok(record),
            Err(MediaError::NotFound) => Err(ServeError::NotFound),
            Err(MediaError::TooLarge { size, limit }) => Err(ServeError::TooLarge(format!(
                "Media is {} bytes which exceeds the limit of {} bytes",
                size, limit
            ))),
            Err(MediaError::Internal(e)) => {
                Err(self.internal(&e, &[("server", server), ("media_id", media_id)]))
            },
        }
    }

    async fn original(&self, record: &MediaRecord) -> Result<Bytes, ServeError> {
        match self.media.download(record).await {
            Ok(data) => Ok(data),
            Err(MediaError::Internal(e)) => Err(self.internal(
                &e,
                &[
                    ("server", record.owner_domain.as_str()),
                    ("media_id", record.media_id.as_str()),
                    ("datastore_id", record.datastore_id.as_str()),
                ],
            )),
            Err(MediaError::NotFound) => Err(ServeError::NotFound),
            Err(other) => Err(ServeError::TooLarge(other.to_string())),
        }
    }

    /// Serves a thumbnail of the media.
    ///
    /// If the media is too large to thumbnail the original bytes are
    /// served instead with `fallback` set.
    pub async fn thumbnail(
        &self,
        server: &str,
        media_id: &str,
        width: Option<&str>,
        height: Option<&str>,
        method: Option<&str>,
    ) -> Result<ServedMedia, ServeError> {
        let request = ThumbnailRequest::parse(width, height, method)
            .map_err(|e| ServeError::BadInput(e.to_string()))?;

        let res = self.media.get_media(server, media_id).await;
        let record = self.resolve(server, media_id, res)?;

        match self.thumbnails.get_thumbnail(&record, request).await {
            Ok(thumbnail) => {
                let data = self.thumbnails.read(&thumbnail).await.map_err(|e| {
                    self.thumbnail_failure(&record, request, e)
                })?;

                Ok(ServedMedia {
                    content_type: thumbnail.content_type,
                    data,
                    fallback: false,
                })
            },
            Err(ThumbnailError::TooLargeForDerivation(reason)) => {
                warn!(
                    server = %server,
                    media_id = %media_id,
                    "Serving original media in place of thumbnail: {}",
                    reason
                );

                let data = self.original(&record).await?;
                Ok(ServedMedia {
                    content_type: record.content_type,
                    data,
                    fallback: true,
                })
            },
            Err(ThumbnailError::BadInput(e)) => Err(ServeError::BadInput(e.to_string())),
            Err(e) => Err(self.thumbnail_failure(&record, request, e)),
        }
    }

    fn thumbnail_failure(&self, record: &MediaRecord, request: ThumbnailRequest, err: ThumbnailError) -> ServeError {
        let key = self.thumbnails.resolve_key(record, request);
        let width = key.width.to_string();
        let height = key.height.to_string();
        let context = [
            ("server", record.owner_domain.as_str()),
            ("media_id", record.media_id.as_str()),
            ("width", width.as_str()),
            ("height", height.as_str()),
            ("method", key.method.as_ref()),
        ];

        match err {
            ThumbnailError::Internal(e) => self.internal(&e, &context),
            other => self.internal(&anyhow::anyhow!(other), &context),
        }
    }

    /// Serves the original bytes of the media.
    pub async fn download(&self, server: &str, media_id: &str) -> Result<ServedMedia, ServeError> {
        let res = self.media.get_media(server, media_id).await;
        let record = self.resolve(server, media_id, res)?;
        let data = self.original(&record).await?;

        Ok(ServedMedia {
            content_type: record.content_type,
            data,
            fallback: false,
        })
    }

    /// Stores new media for the given server.
    pub async fn upload(&self, server: &str, data: Bytes) -> Result<UploadInfo, ServeError> {
        if server.is_empty() {
            return Err(ServeError::BadInput("A server name must be given".to_string()));
        }

        if data.is_empty() {
            return Err(ServeError::BadInput("The uploaded media is empty".to_string()));
        }

        match self.media.upload(server, data).await {
            Ok(record) => Ok(UploadInfo {
                content_uri: format!("mxc://{}/{}", record.owner_domain, record.media_id),
                media_id: record.media_id,
                size_bytes: record.size_bytes,
                content_type: record.content_type,
            }),
            Err(MediaError::TooLarge { size, limit }) => Err(ServeError::TooLarge(format!(
                "Upload is {} bytes which exceeds the limit of {} bytes",
                size, limit
            ))),
            Err(MediaError::NotFound) => Err(ServeError::NotFound),
            Err(MediaError::Internal(e)) => Err(self.internal(&e, &[("server", server)])),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use image::DynamicImage;

    use super::*;
    use crate::config::{OutputFormat, ThumbnailsConfig};
    use crate::media::tests::service;
    use crate::processor::encoder::encode_to;
    use crate::store::{MediaStore, MemoryStore};

    /// Remembers every captured error.
    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub captured: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn capture(&self, err: &anyhow::Error, context: &[(&str, &str)]) {
            let context = context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");

            if let Ok(mut captured) = self.captured.lock() {
                captured.push(format!("{} [{}]", err, context));
            }
        }
    }

    fn controller(
        dir: &std::path::Path,
        max_source_bytes: u64,
    ) -> anyhow::Result<(MediaController, Arc<RecordingReporter>)> {
        let store: Arc<dyn MediaStore> = Arc::new(MemoryStore::default());
        let (media, registry) = service(dir, store.clone(), 1024 * 1024)?;
        let thumbnails = ThumbnailService::new(
            store,
            registry.clone(),
            ThumbnailsConfig {
                max_source_bytes,
                ..Default::default()
            },
        );

        let reporter = Arc::new(RecordingReporter::default());
        let controller = MediaController::new(media, thumbnails, registry, reporter.clone());
        Ok((controller, reporter))
    }

    fn png(width: u32, height: u32) -> anyhow::Result<Bytes> {
        encode_to(&DynamicImage::new_rgb8(width, height), OutputFormat::Png)
    }

    #[tokio::test]
    async fn test_thumbnail_of_uploaded_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, reporter) = controller(dir.path(), 1024 * 1024)?;

        let info = controller.upload("example.org", png(300, 200)?).await;
        let info = info.map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_eq!(info.content_type, "image/png");
        assert_eq!(info.content_uri, format!("mxc://example.org/{}", info.media_id));

        let served = controller
            .thumbnail("example.org", &info.media_id, Some("64"), Some("64"), None)
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert!(!served.fallback);
        assert_eq!(served.content_type, "image/png");

        let decoded = image::load_from_memory(&served.data)?;
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
        assert!(reporter.captured.lock().map(|c| c.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn test_too_large_source_falls_back_to_original() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, _) = controller(dir.path(), 32)?;

        let original = png(300, 200)?;
        let info = controller
            .upload("example.org", original.clone())
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;

        let served = controller
            .thumbnail("example.org", &info.media_id, None, None, None)
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert!(served.fallback);
        assert_eq!(served.content_type, "image/png");
        assert_eq!(served.data, original);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_input_is_not_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, reporter) = controller(dir.path(), 1024)?;

        let res = controller
            .thumbnail("example.org", "abc123", Some("wide"), None, None)
            .await;
        assert!(matches!(res, Err(ServeError::BadInput(_))));

        let res = controller
            .thumbnail("example.org", "abc123", None, None, Some("stretch"))
            .await;
        assert!(matches!(res, Err(ServeError::BadInput(_))));

        let info = controller.upload("example.org", png(10, 10)?).await;
        let info = info.map_err(|e| anyhow::anyhow!("{:?}", e))?;
        let res = controller
            .thumbnail(
                "example.org",
                &info.media_id,
                Some("4294967295"),
                Some("4294967295"),
                Some("crop"),
            )
            .await;
        assert!(matches!(res, Err(ServeError::BadInput(_))));

        assert!(reporter.captured.lock().map(|c| c.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_media() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, _) = controller(dir.path(), 1024)?;

        let res = controller.thumbnail("example.org", "abc123", None, None, None).await;
        assert!(matches!(res, Err(ServeError::NotFound)));

        let res = controller.download("example.org", "abc123").await;
        assert!(matches!(res, Err(ServeError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn test_internal_failure_is_reported_with_identifiers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, reporter) = controller(dir.path(), 1024 * 1024)?;

        let info = controller
            .upload("example.org", Bytes::from_static(b"not an image at all"))
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;

        let res = controller
            .thumbnail("example.org", &info.media_id, Some("32"), Some("32"), Some("crop"))
            .await;
        assert_eq!(res.map(|_| ()), Err(ServeError::Internal));

        let captured = reporter.captured.lock().map(|c| c.clone()).unwrap_or_default();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("server=example.org"));
        assert!(captured[0].contains(&format!("media_id={}", info.media_id)));
        assert!(captured[0].contains("method=crop"));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (controller, _) = controller(dir.path(), 1024)?;

        let res = controller.upload("example.org", Bytes::new()).await;
        assert!(matches!(res, Err(ServeError::BadInput(_))));
        Ok(())
    }
}
