//! Image encoding: page image on disk → base64 PNG wrapped in `ImageData`.
//!
//! Rasterised slides often carry an alpha channel; vision models render
//! transparent regions as black, so the image is flattened onto white first.
//! Large slides are downscaled so the longest edge fits
//! [`crate::config::PipelineConfig::max_rendered_pixels`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Load, flatten, cap and encode a page image for the vision model.
///
/// Blocking; call from `spawn_blocking`.
pub fn encode_page_file(path: &Path, max_pixels: u32) -> Result<ImageData, image::ImageError> {
    let img = image::open(path)?;
    let img = fit_within(flatten_alpha(img), max_pixels);
    encode_page(&img)
}

/// Encode an in-memory page as base64 PNG with `detail: "high"`.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Composite any alpha channel onto a white background.
pub fn flatten_alpha(img: DynamicImage) -> DynamicImage {
    if !img.color().has_alpha() {
        return img;
    }
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let a = a as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    DynamicImage::ImageRgb8(out)
}

/// Downscale so neither edge exceeds `max_pixels`, preserving aspect ratio.
pub fn fit_within(img: DynamicImage, max_pixels: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_pixels && h <= max_pixels {
        return img;
    }
    debug!("Downscaling {}x{} to fit {} px", w, h, max_pixels);
    img.resize(max_pixels, max_pixels, FilterType::Lanczos3)
}
