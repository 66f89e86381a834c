use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use strum::{AsRefStr, Display, EnumString};

use crate::storage::backends::DatastoreConfig;

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    /// The machine identity used for id generation.
    ///
    /// This must be unique for every instance sharing the same metadata store.
    pub machine_id: u16,

    #[serde(default)]
    /// Where the media store persists its records.
    ///
    /// If this is not set records only live in memory.
    pub store_path: Option<PathBuf>,

    /// The configured datastores.
    ///
    /// New media is written to the first enabled datastore.
    pub datastores: Vec<DatastoreConfig>,

    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub uploads: UploadsConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailsConfig,

    #[serde(default = "default_cache_size")]
    /// The maximum number of bytes held by the object cache.
    ///
    /// If this is `0` the cache is disabled.
    ///
    /// Defaults to `64 MiB`.
    pub cache_size: u64,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.datastores.is_empty() {
            return Err(anyhow!("At least one datastore must be configured."));
        }

        if !self.datastores.iter().any(|ds| ds.enabled) {
            return Err(anyhow!("At least one datastore must be enabled."));
        }

        if self.thumbnails.sizes.is_empty() {
            return Err(anyhow!("At least one thumbnail size must be configured."));
        }

        if let Some(size) = self
            .thumbnails
            .sizes
            .iter()
            .find(|s| s.width == 0 || s.height == 0)
        {
            return Err(anyhow!(
                "Thumbnail sizes must be non-zero, got {}x{}",
                size.width,
                size.height
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadsConfig {
    #[serde(default = "default_max_bytes")]
    /// Media larger than this is refused rather than served.
    ///
    /// Defaults to `100 MiB`.
    pub max_bytes: u64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    #[serde(default = "default_max_bytes")]
    /// Uploads larger than this are rejected.
    ///
    /// Defaults to `100 MiB`.
    pub max_bytes: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailsConfig {
    #[serde(default = "default_thumbnail_sizes")]
    /// The thumbnail sizes, the first entry is used when a request
    /// does not give a width or height.
    pub sizes: Vec<ThumbnailSize>,

    #[serde(default = "default_max_source_bytes")]
    /// Source media larger than this is served as-is rather than thumbnailed.
    ///
    /// This is independent of `downloads.max_bytes`.
    ///
    /// Defaults to `10 MiB`.
    pub max_source_bytes: u64,

    #[serde(default = "default_max_pixels")]
    /// Source images with more pixels than this are served as-is rather
    /// than thumbnailed.
    ///
    /// Defaults to `32` megapixels.
    pub max_pixels: u64,

    #[serde(default)]
    /// The encoding used for derived thumbnails.
    pub output_format: OutputFormat,
}

impl Default for ThumbnailsConfig {
    fn default() -> Self {
        Self {
            sizes: default_thumbnail_sizes(),
            max_source_bytes: default_max_source_bytes(),
            max_pixels: default_max_pixels(),
            output_format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl OutputFormat {
    pub fn content_type(&self) -> mime::Mime {
        match self {
            Self::Png => mime::IMAGE_PNG,
            Self::Jpeg => mime::IMAGE_JPEG,
        }
    }
}

impl From<OutputFormat> for image::ImageOutputFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Png => Self::Png,
            OutputFormat::Jpeg => Self::Jpeg(85),
        }
    }
}

const fn default_max_bytes() -> u64 {
    100 * 1024 * 1024
}

const fn default_max_source_bytes() -> u64 {
    10 * 1024 * 1024
}

const fn default_max_pixels() -> u64 {
    32_000_000
}

const fn default_cache_size() -> u64 {
    64 * 1024 * 1024
}

pub(crate) const fn default_true() -> bool {
    true
}

fn default_thumbnail_sizes() -> Vec<ThumbnailSize> {
    [(32, 32), (96, 96), (320, 240), (640, 480), (800, 600)]
        .into_iter()
        .map(|(width, height)| ThumbnailSize { width, height })
        .collect()
}
