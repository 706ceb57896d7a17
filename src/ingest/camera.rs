//! Live camera source.
//!
//! `CameraSource` wraps a capture device. It is responsible for:
//! - Requesting access to the device and negotiating its resolution
//! - Decoding the most recent frame in-memory on each `advance`
//! - Releasing every device track on `close` (idempotent)
//!
//! `stub://` device paths select a synthetic camera. `stub://denied` and
//! `stub://busy` reproduce permission and busy-device failures; `stub://stalled`
//! opens but never delivers a frame.

use image::RgbImage;

#[cfg(feature = "ingest-v4l2")]
use super::v4l2::DeviceCamera;
use super::{synthetic_frame, SourceStats, READY_FRAMES};
use crate::error::SourceFault;
use crate::geometry::Size;

/// Configuration for a live camera.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0").
    pub device: String,
    /// Preferred frame width. The driver may pick the closest supported size.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceCamera),
}

impl CameraBackend {
    fn open(config: &CameraConfig) -> Result<Self, SourceFault> {
        match config.device.as_str() {
            "stub://denied" => Err(SourceFault::PermissionDenied(config.device.clone())),
            "stub://busy" => Err(SourceFault::DeviceUnavailable(format!(
                "{} is in use by another process",
                config.device
            ))),
            device if device.starts_with("stub://") => {
                Ok(Self::Synthetic(SyntheticCamera::new(config)))
            }
            #[cfg(feature = "ingest-v4l2")]
            _ => Ok(Self::Device(DeviceCamera::open(config)?)),
            #[cfg(not(feature = "ingest-v4l2"))]
            _ => Err(SourceFault::DeviceUnavailable(
                "live capture requires the ingest-v4l2 feature".to_string(),
            )),
        }
    }

    fn size(&self) -> Size {
        match self {
            Self::Synthetic(camera) => camera.size,
            #[cfg(feature = "ingest-v4l2")]
            Self::Device(camera) => camera.size(),
        }
    }

    /// `Ok(None)` when the device has nothing new this tick.
    fn next_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        match self {
            Self::Synthetic(camera) => Ok(camera.next_frame()),
            #[cfg(feature = "ingest-v4l2")]
            Self::Device(camera) => camera.next_frame(),
        }
    }
}

pub struct CameraSource {
    config: CameraConfig,
    backend: Option<CameraBackend>,
    current: Option<RgbImage>,
    decoded: u64,
    frames_total: u64,
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            backend: None,
            current: None,
            decoded: 0,
            frames_total: 0,
        }
    }

    /// Request camera access. A no-op when the tracks are already live.
    pub fn open(&mut self) -> Result<(), SourceFault> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend = CameraBackend::open(&self.config)?;
        log::info!(
            "CameraSource: opened {} ({})",
            self.config.device,
            backend.size()
        );
        self.backend = Some(backend);
        self.decoded = 0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn native_size(&self) -> Option<Size> {
        self.backend.as_ref().map(CameraBackend::size)
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some() && self.decoded >= READY_FRAMES
    }

    /// Take the newest frame the device delivered. Never waits on the driver.
    pub fn advance(&mut self) -> Result<(), SourceFault> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let next = backend.next_frame().map_err(|err| {
            log::error!("CameraSource: capture failed on {}: {:#}", self.config.device, err);
            SourceFault::DeviceUnavailable(err.to_string())
        })?;
        let Some(frame) = next else {
            return Ok(());
        };
        self.current = Some(frame);
        self.decoded += 1;
        self.frames_total += 1;
        Ok(())
    }

    pub fn current_frame(&self) -> Option<&RgbImage> {
        self.current.as_ref()
    }

    /// Stop all device tracks. Safe when never opened or already closed.
    pub fn close(&mut self) -> bool {
        self.current = None;
        self.decoded = 0;
        match self.backend.take() {
            Some(_) => {
                log::info!("CameraSource: released {}", self.config.device);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_decoded: self.frames_total,
            location: self.config.device.clone(),
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Synthetic camera (stub://)
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    size: Size,
    frame_count: u64,
    stalled: bool,
}

impl SyntheticCamera {
    fn new(config: &CameraConfig) -> Self {
        Self {
            size: Size::new(config.width, config.height),
            frame_count: 0,
            stalled: config.device == "stub://stalled",
        }
    }

    fn next_frame(&mut self) -> Option<RgbImage> {
        if self.stalled {
            return None;
        }
        self.frame_count += 1;
        Some(synthetic_frame(self.size, self.frame_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(device: &str) -> CameraConfig {
        CameraConfig {
            device: device.to_string(),
            width: 320,
            height: 240,
            target_fps: 30,
        }
    }

    #[test]
    fn stub_camera_reports_negotiated_size() {
        let mut camera = CameraSource::new(config("stub://desk"));
        assert_eq!(camera.native_size(), None);
        camera.open().unwrap();
        assert_eq!(camera.native_size(), Some(Size::new(320, 240)));
    }

    #[test]
    fn permission_and_busy_faults_are_distinguished() {
        let mut denied = CameraSource::new(config("stub://denied"));
        assert!(matches!(
            denied.open(),
            Err(SourceFault::PermissionDenied(_))
        ));
        let mut busy = CameraSource::new(config("stub://busy"));
        assert!(matches!(busy.open(), Err(SourceFault::DeviceUnavailable(_))));
        assert!(!busy.is_open());
    }

    #[test]
    fn close_is_idempotent_and_drops_readiness() {
        let mut camera = CameraSource::new(config("stub://desk"));
        assert!(!camera.close());
        camera.open().unwrap();
        camera.advance().unwrap();
        camera.advance().unwrap();
        assert!(camera.is_ready());
        assert!(camera.close());
        assert!(!camera.close());
        assert!(!camera.is_ready());
        assert!(camera.current_frame().is_none());
        assert_eq!(camera.stats().frames_decoded, 2);
    }

    #[test]
    fn stalled_device_yields_no_frame_without_failing() {
        let mut camera = CameraSource::new(config("stub://stalled"));
        camera.open().unwrap();
        for _ in 0..5 {
            camera.advance().unwrap();
        }
        assert!(camera.is_open());
        assert!(!camera.is_ready());
        assert!(camera.current_frame().is_none());
        assert_eq!(camera.stats().frames_decoded, 0);
    }

    #[test]
    fn advance_on_closed_camera_is_a_no_op() {
        let mut camera = CameraSource::new(config("stub://desk"));
        camera.advance().unwrap();
        assert!(camera.current_frame().is_none());
    }
}
