//! Face photo normalization
//!
//! Devices accept JPEGs of at most 100 KiB, bounded by the device's maximum
//! resolution, with height ≤ 2× width. `Transcoder` resizes toward the
//! recommended 500×500 envelope and walks JPEG quality down until the size bound
//! holds, then retries once at a smaller resolution before giving up with
//! `PhotoError::SizeViolation`. It never returns an oversized payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView};
use std::path::Path;

use crate::services::image_cache::PhotoError;

/// Size and resolution envelope for device-ready photos
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoEnvelope {
    /// Hard device limits
    pub max_width: u32,
    pub max_height: u32,
    /// Recommended resolution
    pub target_width: u32,
    pub target_height: u32,
    /// Encoded JPEG size bound
    pub max_bytes: usize,
    pub start_quality: u8,
    pub quality_step: u8,
    pub min_quality: u8,
    /// Square bound and quality of the last-resort attempt
    pub fallback_size: u32,
    pub fallback_quality: u8,
}

impl Default for PhotoEnvelope {
    fn default() -> Self {
        Self {
            max_width: 1080,
            max_height: 1920,
            target_width: 500,
            target_height: 500,
            max_bytes: 100 * 1024,
            start_quality: 90,
            quality_step: 10,
            min_quality: 30,
            fallback_size: 320,
            fallback_quality: 50,
        }
    }
}

/// Photo ready to send to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPhoto {
    pub base64: String,
    /// Encoded JPEG size before base64
    pub byte_len: usize,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

/// JPEG normalizer for one envelope
#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    envelope: PhotoEnvelope,
}

impl Transcoder {
    pub fn new(envelope: PhotoEnvelope) -> Self {
        Self { envelope }
    }

    pub fn envelope(&self) -> &PhotoEnvelope {
        &self.envelope
    }

    /// Read and transcode a cached photo on the blocking pool
    pub async fn transcode(&self, path: &Path) -> Result<ProcessedPhoto, PhotoError> {
        let path = path.to_path_buf();
        let transcoder = self.clone();

        tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(&path)?;
            transcoder.transcode_bytes(&bytes)
        })
        .await
        .map_err(|e| PhotoError::Decode(format!("transcode task failed: {}", e)))?
    }

    /// Transcode raw image bytes
    ///
    /// **Algorithm:**
    /// 1. Decode, crop height to ≤ 2× width (centered)
    /// 2. Shrink to fit min(target, device max), preserving aspect
    /// 3. Encode at start quality, step down while oversized and above the floor
    /// 4. Still oversized: shrink to the fallback square, encode at fallback quality
    /// 5. Still oversized: `SizeViolation`
    pub fn transcode_bytes(&self, bytes: &[u8]) -> Result<ProcessedPhoto, PhotoError> {
        let env = &self.envelope;
        let decoded =
            image::load_from_memory(bytes).map_err(|e| PhotoError::Decode(e.to_string()))?;

        let bound_w = env.target_width.min(env.max_width);
        let bound_h = env.target_height.min(env.max_height);
        let image = fit_within(limit_aspect(decoded), bound_w, bound_h);

        let mut quality = env.start_quality;
        let mut smallest = usize::MAX;
        loop {
            let encoded = encode_jpeg(&image, quality)?;
            smallest = smallest.min(encoded.len());
            if encoded.len() <= env.max_bytes {
                return Ok(finish(encoded, &image, quality));
            }
            if quality <= env.min_quality {
                break;
            }
            quality = quality.saturating_sub(env.quality_step).max(env.min_quality);
        }

        tracing::debug!(
            bytes = smallest,
            limit = env.max_bytes,
            "Quality floor reached, retrying at fallback resolution"
        );

        let fallback = fit_within(image, env.fallback_size, env.fallback_size);
        let encoded = encode_jpeg(&fallback, env.fallback_quality)?;
        smallest = smallest.min(encoded.len());
        if encoded.len() <= env.max_bytes {
            return Ok(finish(encoded, &fallback, env.fallback_quality));
        }

        Err(PhotoError::SizeViolation {
            bytes: smallest,
            limit: env.max_bytes,
        })
    }
}

fn finish(encoded: Vec<u8>, image: &DynamicImage, quality: u8) -> ProcessedPhoto {
    ProcessedPhoto {
        byte_len: encoded.len(),
        base64: BASE64.encode(&encoded),
        width: image.width(),
        height: image.height(),
        quality,
    }
}

/// Center-crop so that height ≤ 2× width
fn limit_aspect(image: DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    let max_height = width.saturating_mul(2);
    if height <= max_height || width == 0 {
        return image;
    }
    let top = (height - max_height) / 2;
    image.crop_imm(0, top, width, max_height)
}

/// Shrink (never enlarge) to fit within `max_w`×`max_h`
fn fit_within(image: DynamicImage, max_w: u32, max_h: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_w && height <= max_h {
        return image;
    }
    // Rounding during resize can tip a 1:2 image just past the aspect limit
    limit_aspect(image.resize(max_w, max_h, FilterType::Lanczos3))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, PhotoError> {
    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| PhotoError::Decode(format!("JPEG encode failed: {}", e)))?;
    Ok(buffer)
}
