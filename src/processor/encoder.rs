use std::io::Cursor;

use bytes::Bytes;
use image::DynamicImage;

use crate::config::OutputFormat;

#[inline]
pub fn encode_to(img: &DynamicImage, format: OutputFormat) -> anyhow::Result<Bytes> {
    // Jpeg has no alpha channel.
    let img = match format {
        OutputFormat::Jpeg if img.color().has_alpha() => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    };

    let mut buff = Cursor::new(Vec::new());
    img.write_to(&mut buff, format)?;
    Ok(Bytes::from(buff.into_inner()))
}
