use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};

use super::{EncodedFrame, RawImage};
use crate::error::{EncodeErrorKind, RelayError, Result};

/// Default JPEG quality. Fixed; there is no adaptive bitrate.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
/// Default upper bound on one encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 512 * 1024;
/// Times an over-budget frame is halved in size before giving up.
const MAX_DOWNSCALES: u32 = 3;

/// Turns a raw image into a compressed, size-bounded payload.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, image: &RawImage) -> Result<EncodedFrame>;
}

/// Baseline JPEG at a fixed quality.
///
/// If the result exceeds `max_bytes` the image is re-encoded at half width
/// and height, up to three times.
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    quality: u8,
    max_bytes: usize,
}

impl JpegEncoder {
    pub fn new(quality: u8, max_bytes: usize) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_bytes,
        }
    }

    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(pixels, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| RelayError::EncodeFailure {
                kind: EncodeErrorKind::Codec(e.to_string()),
            })?;
        Ok(out)
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY, DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, image: &RawImage) -> Result<EncodedFrame> {
        if image.pixels.len() != image.expected_len() || image.width == 0 || image.height == 0 {
            return Err(RelayError::EncodeFailure {
                kind: EncodeErrorKind::BufferMismatch,
            });
        }

        let mut width = image.width;
        let mut height = image.height;
        let mut data = self.encode_rgb(&image.pixels, width, height)?;
        let mut scaled: Option<RgbImage> = None;

        for _ in 0..MAX_DOWNSCALES {
            if data.len() <= self.max_bytes || (width == 1 && height == 1) {
                break;
            }
            let source = match scaled.take() {
                Some(img) => img,
                None => RgbImage::from_raw(image.width, image.height, image.pixels.clone())
                    .ok_or(RelayError::EncodeFailure {
                        kind: EncodeErrorKind::BufferMismatch,
                    })?,
            };
            width = (width / 2).max(1);
            height = (height / 2).max(1);
            let smaller = imageops::resize(&source, width, height, FilterType::Triangle);
            tracing::debug!(bytes = data.len(), limit = self.max_bytes, width, height, "frame over budget, downscaling");
            data = self.encode_rgb(smaller.as_raw(), width, height)?;
            scaled = Some(smaller);
        }

        if data.len() > self.max_bytes {
            return Err(RelayError::EncodeFailure {
                kind: EncodeErrorKind::OverBudget {
                    bytes: data.len(),
                    limit: self.max_bytes,
                },
            });
        }

        Ok(EncodedFrame {
            data,
            width,
            height,
            captured_at: image.captured_at,
        })
    }
}
