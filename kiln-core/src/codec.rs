use std::io::Cursor;

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

use crate::{GenerationError, Result};

pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Serializes an image to a base64 PNG data URI.
pub fn encode_data_uri(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| GenerationError::Pipeline(format!("failed to encode PNG: {e}")))?;
    Ok(format!("{DATA_URI_PREFIX}{}", BASE64_STANDARD.encode(&bytes)))
}

/// Decodes a data URI (or bare base64) into an RGB image.
pub fn decode_data_uri(data: &str) -> Result<RgbImage> {
    Ok(decode_payload(data)?.to_rgb8())
}

/// Decodes a data URI (or bare base64) into a single-channel mask.
pub fn decode_mask(data: &str) -> Result<GrayImage> {
    Ok(decode_payload(data)?.to_luma8())
}

fn decode_payload(data: &str) -> Result<DynamicImage> {
    let payload = match data.split_once(',') {
        Some((_meta, payload)) => payload,
        None => data,
    };
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| GenerationError::Decode(format!("not valid base64: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| GenerationError::Decode(format!("not a decodable image: {e}")))
}
