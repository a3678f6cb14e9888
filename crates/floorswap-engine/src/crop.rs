use floorswap_contracts::request::ImagePayload;
use image::{DynamicImage, RgbImage};

use crate::error::Result;
use crate::normalize::{encode_rgb, flatten_to_rgb, OutputFormat};

pub const CENTER_CROP_SIDE: u32 = 512;
pub const CORNER_CROP_MAX_SIDE: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub side: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropKind {
    Center,
    Corner,
}

#[derive(Debug, Clone)]
pub struct TextureCrop {
    pub kind: CropKind,
    pub region: CropRegion,
    pub payload: ImagePayload,
}

/// Square of side `min(512, width, height)` centered on the image.
pub fn center_crop_region(width: u32, height: u32) -> CropRegion {
    let side = CENTER_CROP_SIDE.min(width).min(height);
    CropRegion {
        x: width / 2 - side / 2,
        y: height / 2 - side / 2,
        side,
    }
}

/// Square anchored at the top-left corner, side `min(width/2, height/2, 1500)`.
pub fn corner_crop_region(width: u32, height: u32) -> CropRegion {
    let side = (width / 2)
        .min(height / 2)
        .min(CORNER_CROP_MAX_SIDE)
        .max(1)
        .min(width.min(height));
    CropRegion { x: 0, y: 0, side }
}

pub fn crop_region(image: &RgbImage, region: CropRegion) -> RgbImage {
    image::imageops::crop_imm(image, region.x, region.y, region.side, region.side).to_image()
}

/// Center and corner close-ups of a reference, each re-encoded as JPEG.
pub fn texture_crops(image: &DynamicImage) -> Result<Vec<TextureCrop>> {
    let rgb = flatten_to_rgb(image);
    let (width, height) = rgb.dimensions();
    let mut crops = Vec::with_capacity(2);
    for (kind, region) in [
        (CropKind::Center, center_crop_region(width, height)),
        (CropKind::Corner, corner_crop_region(width, height)),
    ] {
        let encoded = encode_rgb(&crop_region(&rgb, region), OutputFormat::Jpeg)?;
        crops.push(TextureCrop {
            kind,
            region,
            payload: ImagePayload::new(encoded, OutputFormat::Jpeg.mime_type()),
        });
    }
    Ok(crops)
}
