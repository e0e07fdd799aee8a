use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;

use crate::models::DecodedImage;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

/// Decodes any supported container and normalizes it to three channels.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<DecodedImage, image::ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    Ok(DecodedImage::new(decoded.to_rgb8()))
}

pub fn encode_jpeg(image: &DecodedImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .pixels()
        .write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))
        .map_err(|err| anyhow!("JPEG encoding failed: {err}"))?;
    Ok(bytes)
}

pub fn encode_png(image: &DecodedImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .pixels()
        .write_with_encoder(PngEncoder::new(&mut bytes))
        .map_err(|err| anyhow!("PNG encoding failed: {err}"))?;
    Ok(bytes)
}

pub fn to_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Reverses `to_base64(encode_png(..))` style payloads coming back from a worker.
pub fn decode_base64_image(encoded: &str) -> Result<DecodedImage> {
    let trimmed = encoded.trim();
    let payload = trimmed
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(trimmed);
    let bytes = general_purpose::STANDARD
        .decode(payload)
        .map_err(|err| anyhow!("invalid base64 image payload: {err}"))?;
    decode_image_bytes(&bytes).map_err(|err| anyhow!("invalid image payload: {err}"))
}
