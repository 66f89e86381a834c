use std::io::Cursor;

use anyhow::anyhow;
use bytes::Bytes;
use image::io::Reader as ImageReader;

use crate::config::OutputFormat;
use crate::errors::ThumbnailError;
use crate::thumbnail::ThumbnailMethod;

pub mod encoder;
pub mod resizer;

pub struct DerivationJob {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub method: ThumbnailMethod,
    pub format: OutputFormat,
    pub max_pixels: u64,
}

pub struct DerivedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
}

/// Decodes, resizes and re-encodes the source image.
///
/// This is CPU bound and should be run via [`derive_on_pool`].
pub fn derive(job: DerivationJob) -> Result<DerivedImage, ThumbnailError> {
    let (source_width, source_height) = ImageReader::new(Cursor::new(job.data.as_ref()))
        .with_guessed_format()
        .map_err(ThumbnailError::internal)?
        .into_dimensions()
        .map_err(ThumbnailError::internal)?;

    let pixels = source_width as u64 * source_height as u64;
    if pixels > job.max_pixels {
        return Err(ThumbnailError::TooLargeForDerivation(format!(
            "{}x{} exceeds the limit of {} pixels",
            source_width, source_height, job.max_pixels
        )));
    }

    let img = image::load_from_memory(&job.data).map_err(ThumbnailError::internal)?;
    let resized = resizer::resize(job.method, &img, job.width, job.height);
    let data = encoder::encode_to(&resized, job.format)?;

    Ok(DerivedImage {
        data,
        width: resized.width(),
        height: resized.height(),
        content_type: job.format.content_type().to_string(),
    })
}

/// Runs the derivation on the rayon pool without blocking the runtime.
pub async fn derive_on_pool(job: DerivationJob) -> Result<DerivedImage, ThumbnailError> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    rayon::spawn(move || {
        let _ = tx.send(derive(job));
    });

    rx.await
        .map_err(|_| ThumbnailError::internal(anyhow!("Derivation worker exited without a result")))?
}
