use std::io::Cursor;

use floorswap_contracts::request::ImagePayload;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::error::{FloorError, Result};

pub const DEFAULT_TARGET_LONG_SIDE: u32 = 3000;
pub const JPEG_QUALITY: u8 = 92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

/// Re-encoded image ready to send, with its transmitted dimensions.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub payload: ImagePayload,
    pub width: u32,
    pub height: u32,
    pub original_bytes: usize,
}

impl NormalizedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Decode, flatten to RGB, downscale so the long side is at most
/// `target_long_side`, then re-encode. Never upscales.
pub fn normalize_image_bytes(
    bytes: &[u8],
    target_long_side: u32,
    format: OutputFormat,
) -> Result<NormalizedImage> {
    let decoded = decode_image(bytes, "input image")?;
    let mut rgb = flatten_to_rgb(&decoded);
    let (width, height) = rgb.dimensions();
    let (target_w, target_h) = scaled_dimensions(width, height, target_long_side);
    if (target_w, target_h) != (width, height) {
        rgb = image::imageops::resize(&rgb, target_w, target_h, FilterType::Lanczos3);
    }
    let encoded = encode_rgb(&rgb, format)?;
    Ok(NormalizedImage {
        payload: ImagePayload::new(encoded, format.mime_type()),
        width: rgb.width(),
        height: rgb.height(),
        original_bytes: bytes.len(),
    })
}

pub fn decode_image(bytes: &[u8], what: &str) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|source| FloorError::Decode {
        what: what.to_string(),
        source,
    })
}

/// Three-channel copy of any decoded image; transparent pixels are blended
/// over white.
pub fn flatten_to_rgb(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    flattened
}

/// Uniform downscale so the long side equals `target_long_side`; the short
/// side rounds down but never reaches zero.
pub fn scaled_dimensions(width: u32, height: u32, target_long_side: u32) -> (u32, u32) {
    let long_side = width.max(height);
    let target = target_long_side.max(1);
    if long_side <= target {
        return (width, height);
    }
    let scale = |side: u32| -> u32 {
        let scaled = u64::from(side) * u64::from(target) / u64::from(long_side);
        (scaled as u32).max(1)
    };
    if width >= height {
        (target, scale(height))
    } else {
        (scale(width), target)
    }
}

pub fn encode_rgb(image: &RgbImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
            encoder.encode_image(image).map_err(FloorError::Encode)?;
        }
        OutputFormat::Png | OutputFormat::WebP => {
            let image_format = if format == OutputFormat::Png {
                ImageFormat::Png
            } else {
                ImageFormat::WebP
            };
            DynamicImage::ImageRgb8(image.clone())
                .write_to(&mut Cursor::new(&mut bytes), image_format)
                .map_err(FloorError::Encode)?;
        }
    }
    Ok(bytes)
}
