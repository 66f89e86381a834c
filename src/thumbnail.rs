use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing_futures::Instrument;

use crate::config::ThumbnailsConfig;
use crate::datastore::DatastoreRegistry;
use crate::errors::{BadInput, ThumbnailError};
use crate::media::MediaRecord;
use crate::processor::{self, DerivationJob};
use crate::store::MediaStore;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ThumbnailMethod {
    /// Resize then centre crop to exactly the requested size.
    Crop,

    /// Resize to fit within the requested size.
    Scale,
}

impl Default for ThumbnailMethod {
    fn default() -> Self {
        Self::Crop
    }
}

/// Identifies a single thumbnail variant of a piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationKey {
    pub owner_domain: String,
    pub media_id: String,
    pub width: u32,
    pub height: u32,
    pub method: ThumbnailMethod,
}

/// A derived thumbnail, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub owner_domain: String,
    pub media_id: String,
    pub width: u32,
    pub height: u32,
    pub method: ThumbnailMethod,
    pub content_type: String,
    pub size_bytes: u64,
    pub datastore_id: String,
    pub location: String,
}

impl ThumbnailRecord {
    pub fn key(&self) -> DerivationKey {
        DerivationKey {
            owner_domain: self.owner_domain.clone(),
            media_id: self.media_id.clone(),
            width: self.width,
            height: self.height,
            method: self.method,
        }
    }
}

/// The caller supplied thumbnail parameters.
///
/// Anything left as `None` falls back to the configured defaults.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub method: Option<ThumbnailMethod>,
}

impl ThumbnailRequest {
    /// Parses the raw query parameters of a thumbnail request.
    ///
    /// Empty values are treated as absent.
    pub fn parse(
        width: Option<&str>,
        height: Option<&str>,
        method: Option<&str>,
    ) -> Result<Self, BadInput> {
        Ok(Self {
            width: parse_dimension("Width", width)?,
            height: parse_dimension("Height", height)?,
            method: match method.filter(|m| !m.is_empty()) {
                None => None,
                Some(method) => Some(ThumbnailMethod::from_str(method).map_err(|_| {
                    BadInput(format!("Method must be one of crop or scale, got {:?}", method))
                })?),
            },
        })
    }
}

fn parse_dimension(name: &str, value: Option<&str>) -> Result<Option<u32>, BadInput> {
    let value = match value.filter(|v| !v.is_empty()) {
        None => return Ok(None),
        Some(value) => value,
    };

    match value.parse::<i64>() {
        Err(_) => Err(BadInput(format!("{} does not appear to be an integer", name))),
        Ok(parsed) if parsed <= 0 || parsed > u32::MAX as i64 => {
            Err(BadInput(format!("{} must be a positive integer", name)))
        },
        Ok(parsed) => Ok(Some(parsed as u32)),
    }
}

type SharedDerivation = Shared<BoxFuture<'static, Result<ThumbnailRecord, ThumbnailError>>>;
type InFlight = Arc<Mutex<HashMap<DerivationKey, SharedDerivation>>>;

/// Removes a derivation key from the in-flight map once its task ends,
/// including when the task panics.
struct InFlightGuard {
    in_flight: InFlight,
    key: DerivationKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Derives, caches and serves thumbnails.
///
/// At most one derivation runs per derivation key, concurrent callers for
/// the same key all observe the outcome of that one derivation.
#[derive(Clone)]
pub struct ThumbnailService {
    store: Arc<dyn MediaStore>,
    registry: Arc<DatastoreRegistry>,
    cfg: Arc<ThumbnailsConfig>,
    in_flight: InFlight,
    derivations: Arc<AtomicUsize>,
}

impl ThumbnailService {
    pub fn new(
        store: Arc<dyn MediaStore>,
        registry: Arc<DatastoreRegistry>,
        cfg: ThumbnailsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cfg: Arc::new(cfg),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            derivations: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[cfg(test)]
    pub fn derivations_performed(&self) -> usize {
        self.derivations.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The largest width and height across the configured sizes.
    ///
    /// Requests beyond either bound are refused rather than derived.
    fn max_dimensions(&self) -> (u32, u32) {
        if self.cfg.sizes.is_empty() {
            return (32, 32);
        }

        self.cfg
            .sizes
            .iter()
            .fold((0, 0), |(w, h), size| (w.max(size.width), h.max(size.height)))
    }

    /// Applies the configured defaults to a request.
    pub fn resolve_key(&self, media: &MediaRecord, request: ThumbnailRequest) -> DerivationKey {
        let default_size = self.cfg.sizes.first().copied();

        DerivationKey {
            owner_domain: media.owner_domain.clone(),
            media_id: media.media_id.clone(),
            width: request
                .width
                .or_else(|| default_size.map(|s| s.width))
                .unwrap_or(32),
            height: request
                .height
                .or_else(|| default_size.map(|s| s.height))
                .unwrap_or(32),
            method: request.method.unwrap_or_default(),
        }
    }

    /// Gets the thumbnail of the media, deriving it if it does not exist yet.
    ///
    /// Failures are never cached, the next request for the same key will
    /// attempt the derivation again.
    pub async fn get_thumbnail(
        &self,
        media: &MediaRecord,
        request: ThumbnailRequest,
    ) -> Result<ThumbnailRecord, ThumbnailError> {
        let key = self.resolve_key(media, request);

        let (max_width, max_height) = self.max_dimensions();
        if key.width > max_width || key.height > max_height {
            return Err(BadInput(format!(
                "Thumbnails are limited to {}x{}, got {}x{}",
                max_width, max_height, key.width, key.height
            ))
            .into());
        }

        if let Some(existing) = self.store.get_thumbnail(&key).await? {
            return Ok(existing);
        }

        let derivation = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

            match in_flight.get(&key) {
                Some(derivation) => derivation.clone(),
                None => {
                    let derivation = self.spawn_derivation(key.clone(), media.clone());
                    in_flight.insert(key, derivation.clone());
                    derivation
                },
            }
        };

        derivation.await
    }

    /// Reads the stored bytes of a thumbnail.
    pub async fn read(&self, thumbnail: &ThumbnailRecord) -> Result<Bytes, ThumbnailError> {
        let data = self
            .registry
            .fetch(&thumbnail.datastore_id, &thumbnail.location)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "Thumbnail of {}/{} is missing from datastore {} @ {}",
                    thumbnail.owner_domain,
                    thumbnail.media_id,
                    thumbnail.datastore_id,
                    thumbnail.location
                )
            })?;

        Ok(data)
    }

    /// Starts the derivation as its own task so callers going away never
    /// abort a derivation other callers are waiting on.
    fn spawn_derivation(&self, key: DerivationKey, media: MediaRecord) -> SharedDerivation {
        let this = self.clone();
        let span = info_span!(
            "derive_thumbnail",
            server = %key.owner_domain,
            media_id = %key.media_id,
            width = key.width,
            height = key.height,
            method = %key.method,
        );

        let handle = tokio::spawn(
            async move {
                let _guard = InFlightGuard {
                    in_flight: this.in_flight.clone(),
                    key: key.clone(),
                };

                this.derive(&key, &media).await
            }
            .instrument(span),
        );

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ThumbnailError::internal(e)),
            }
        }
        .boxed()
        .shared()
    }

    async fn derive(&self, key: &DerivationKey, media: &MediaRecord) -> Result<ThumbnailRecord, ThumbnailError> {
        // A previous derivation may have finished between the cache check and
        // this task being registered.
        if let Some(existing) = self.store.get_thumbnail(key).await? {
            return Ok(existing);
        }

        if media.size_bytes > self.cfg.max_source_bytes {
            return Err(ThumbnailError::TooLargeForDerivation(format!(
                "{} bytes exceeds the limit of {} bytes",
                media.size_bytes, self.cfg.max_source_bytes
            )));
        }

        let total = self.derivations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(derivations_total = total, "Deriving thumbnail");

        let data = self
            .registry
            .fetch(&media.datastore_id, &media.location)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "Source media is missing from datastore {} @ {}",
                    media.datastore_id,
                    media.location
                )
            })?;

        let derived = processor::derive_on_pool(DerivationJob {
            data,
            width: key.width,
            height: key.height,
            method: key.method,
            format: self.cfg.output_format,
            max_pixels: self.cfg.max_pixels,
        })
        .await?;

        let stored = self
            .registry
            .store_bytes(derived.data, &derived.content_type)
            .await?;

        let record = ThumbnailRecord {
            owner_domain: key.owner_domain.clone(),
            media_id: key.media_id.clone(),
            width: key.width,
            height: key.height,
            method: key.method,
            content_type: derived.content_type,
            size_bytes: stored.size_bytes,
            datastore_id: stored.datastore_id,
            location: stored.location,
        };

        let record = self.store.insert_thumbnail(record).await?;
        info!(
            actual_width = derived.width,
            actual_height = derived.height,
            size = record.size_bytes,
            "Stored new thumbnail"
        );

        Ok(record)
    }
}
