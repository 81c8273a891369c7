//! Capture, encoding and pacing for the publisher.
//!
//! A publisher tick moves one image through three stages:
//!
//! | Stage | Module | Failure |
//! |-------|--------|---------|
//! | Grab the latest image | [`capture`] | not ready → skip; revoked → end session |
//! | Compress to a bounded payload | [`encoder`] | log and skip the tick |
//! | Wait for the next tick boundary | [`rate`] | none |
//!
//! ## Adding a capture backend
//!
//! 1. Implement [`CaptureSource`] for the device type
//! 2. Report "no frame yet" as [`CaptureError::NotReady`], not as an error
//! 3. Report permanent loss as [`CaptureError::Revoked`]
//! 4. Hand it to [`crate::Publisher::new`]

pub mod capture;
pub mod encoder;
pub mod rate;

use tokio::time::Instant;

pub use capture::{CaptureError, CaptureSource, DeviceRegistry, SyntheticCamera};
pub use encoder::{FrameEncoder, JpegEncoder};
pub use rate::{RateBudget, RateLimiter};

/// One uncompressed RGB8 image as produced by a capture source.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
    pub captured_at: Instant,
}

impl RawImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
            captured_at: Instant::now(),
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// A compressed frame ready to send.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}
