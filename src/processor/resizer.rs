use enum_dispatch::enum_dispatch;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::thumbnail::ThumbnailMethod;

/// Resizing strategies are selected here by thumbnail method.
#[allow(clippy::enum_variant_names)]
#[enum_dispatch(Resize)]
pub enum ResizerSelector {
    CropResizer,
    ScaleResizer,
}

impl From<ThumbnailMethod> for ResizerSelector {
    fn from(method: ThumbnailMethod) -> Self {
        match method {
            ThumbnailMethod::Crop => CropResizer.into(),
            ThumbnailMethod::Scale => ScaleResizer.into(),
        }
    }
}

#[enum_dispatch]
pub trait Resize {
    fn resize(&self, img: &DynamicImage, width: u32, height: u32) -> DynamicImage;
}

/// Fills the target box then crops the overflow from the centre.
///
/// The output always has exactly the requested dimensions.
pub struct CropResizer;

impl Resize for CropResizer {
    fn resize(&self, img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
        img.resize_to_fill(width, height, FilterType::Lanczos3)
    }
}

/// Fits the image inside the target box preserving its aspect ratio.
///
/// Images which already fit are never upscaled.
pub struct ScaleResizer;

impl Resize for ScaleResizer {
    fn resize(&self, img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
        if img.width() <= width && img.height() <= height {
            return img.clone();
        }

        img.resize(width, height, FilterType::Lanczos3)
    }
}

pub fn resize(method: ThumbnailMethod, img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    ResizerSelector::from(method).resize(img, width, height)
}
