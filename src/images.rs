//! Image decoding and channel normalization.
//!
//! Every image that reaches the embedding model, archive photo or user
//! query, goes through [`normalize`]: decode, collapse to single-channel
//! luma, expand back to three identical RGB channels. Black-and-white scans
//! and colour uploads end up in the same colour space.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, RgbImage};

/// Tag for the preprocessing convention; part of the index identity.
pub const PREPROCESS_CONVENTION: &str = "luma-to-rgb-v1";

/// Side length of the generated placeholder image
const PLACEHOLDER_SIZE: u32 = 256;

/// Decode raw bytes in any supported raster format.
pub fn decode(data: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(data)
}

/// Collapse to luma, then expand to three channels.
pub fn normalize_channels(img: &DynamicImage) -> RgbImage {
    DynamicImage::ImageLuma8(img.to_luma8()).to_rgb8()
}

/// Decode and normalize in one step.
pub fn normalize(data: &[u8]) -> Result<RgbImage, image::ImageError> {
    decode(data).map(|img| normalize_channels(&img))
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(buf)
}

/// A neutral grey PNG shown in place of images missing from the corpus.
pub fn placeholder_png() -> Result<Vec<u8>> {
    let img = RgbImage::from_fn(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, |x, y| {
        // thin diagonal cross on grey
        if x == y || x + y == PLACEHOLDER_SIZE - 1 {
            image::Rgb([160, 160, 160])
        } else {
            image::Rgb([210, 210, 210])
        }
    });
    encode_png(&img)
}

/// Best-effort MIME type for display bytes.
pub fn mime_type(data: &[u8]) -> &'static str {
    infer::get(data)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}
