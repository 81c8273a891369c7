use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::RawImage;
use crate::error::RelayError;

/// Why a capture source could not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// No new image is available yet. Not a failure.
    #[error("no frame ready")]
    NotReady,
    /// A one-off read failure; the next tick may succeed.
    #[error("transient capture error: {0}")]
    Transient(String),
    /// The device refused to open (permission, missing device, insecure context).
    #[error("capture denied: {0}")]
    Denied(String),
    /// The device was taken away for good.
    #[error("capture revoked: {0}")]
    Revoked(String),
}

impl From<CaptureError> for RelayError {
    fn from(e: CaptureError) -> Self {
        RelayError::CaptureUnavailable(e.to_string())
    }
}

/// A live image source, e.g. a camera.
///
/// Calls are made from a single publisher loop. `grab` must not block for
/// longer than a tick; return [`CaptureError::NotReady`] instead.
pub trait CaptureSource: Send {
    /// Identifier used for exclusive ownership across publishers.
    fn device_id(&self) -> &str;

    /// Open the device. Called once before the first `grab`.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Latest available image.
    fn grab(&mut self) -> Result<RawImage, CaptureError>;

    /// Release the device. Must be idempotent.
    fn release(&mut self);
}

/// Process-wide set of claimed capture devices.
///
/// A device id can be claimed by one publisher at a time; a second claim
/// fails immediately.
pub struct DeviceRegistry {
    claimed: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    pub fn global() -> &'static DeviceRegistry {
        static REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| DeviceRegistry {
            claimed: Mutex::new(HashSet::new()),
        })
    }

    /// Claim `device_id`. Returns `false` if it is already held.
    pub fn claim(&self, device_id: &str) -> bool {
        let claimed = self.claimed.lock().insert(device_id.to_string());
        if claimed {
            tracing::debug!(device_id, "capture device claimed");
        }
        claimed
    }

    pub fn release(&self, device_id: &str) {
        if self.claimed.lock().remove(device_id) {
            tracing::debug!(device_id, "capture device released");
        }
    }

    pub fn is_claimed(&self, device_id: &str) -> bool {
        self.claimed.lock().contains(device_id)
    }
}

/// Generated test pattern: a diagonal gradient that shifts every grab.
pub struct SyntheticCamera {
    device_id: String,
    width: u32,
    height: u32,
    frame: u32,
    open: bool,
}

impl SyntheticCamera {
    pub fn new(device_id: &str, width: u32, height: u32) -> Self {
        Self {
            device_id: device_id.to_string(),
            width,
            height,
            frame: 0,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl CaptureSource for SyntheticCamera {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Denied("zero-sized capture".to_string()));
        }
        self.open = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<RawImage, CaptureError> {
        if !self.open {
            return Err(CaptureError::Revoked("camera not open".to_string()));
        }
        let shift = self.frame;
        self.frame = self.frame.wrapping_add(1);

        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = x.wrapping_add(y).wrapping_add(shift.wrapping_mul(4));
                pixels.push((v & 0xff) as u8);
                pixels.push((y & 0xff) as u8);
                pixels.push((shift & 0xff) as u8);
            }
        }
        Ok(RawImage::new(self.width, self.height, pixels))
    }

    fn release(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let registry = DeviceRegistry::global();
        assert!(registry.claim("capture-test-exclusive"));
        assert!(!registry.claim("capture-test-exclusive"));
        registry.release("capture-test-exclusive");
        assert!(registry.claim("capture-test-exclusive"));
        registry.release("capture-test-exclusive");
        assert!(!registry.is_claimed("capture-test-exclusive"));
    }

    #[test]
    fn synthetic_frames_change() {
        let mut cam = SyntheticCamera::new("synthetic-test", 8, 4);
        cam.open().unwrap();
        let a = cam.grab().unwrap();
        let b = cam.grab().unwrap();
        assert_eq!(a.pixels.len(), a.expected_len());
        assert_ne!(a.pixels, b.pixels);
    }

    #[test]
    fn synthetic_grab_after_release_is_revoked() {
        let mut cam = SyntheticCamera::new("synthetic-test-2", 8, 4);
        cam.open().unwrap();
        cam.release();
        cam.release();
        assert!(matches!(cam.grab(), Err(CaptureError::Revoked(_))));
    }

    #[test]
    fn zero_sized_camera_denied() {
        let mut cam = SyntheticCamera::new("synthetic-test-3", 0, 4);
        assert!(matches!(cam.open(), Err(CaptureError::Denied(_))));
    }
}
