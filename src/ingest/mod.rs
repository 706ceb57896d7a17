//! Frame sources.
//!
//! This module provides the two media sources the pipeline can run on:
//! - Live cameras (V4L2 devices, feature: ingest-v4l2)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` variants of both (testing, demos)
//!
//! Both are wrapped in the tagged `FrameSource` so the rest of the pipeline sees
//! one capability surface: readiness, native resolution, end-of-stream, and a
//! non-blocking grab of the current visual frame.
//!
//! Sources are pumped once per scheduler tick via `advance`. They never block
//! waiting for readiness; callers retry on the next tick.

pub mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "ingest-v4l2")]
pub(crate) mod v4l2;

use std::time::Instant;

use image::RgbImage;

use crate::error::SourceFault;
use crate::geometry::Size;

pub use camera::{CameraConfig, CameraSource};
pub use file::{FileVideoConfig, FileVideoSource};

/// Decoded frames required before a source counts as ready.
pub const READY_FRAMES: u64 = 2;

/// Which kind of media a session runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    LiveCamera,
    FileVideo,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LiveCamera => f.write_str("camera"),
            Self::FileVideo => f.write_str("file"),
        }
    }
}

/// What to open when switching modes.
#[derive(Clone, Debug)]
pub enum SourceSpec {
    Camera(CameraConfig),
    File(FileVideoConfig),
}

impl SourceSpec {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Camera(_) => SourceKind::LiveCamera,
            Self::File(_) => SourceKind::FileVideo,
        }
    }
}

/// Outcome of grabbing the current visual frame.
#[derive(Debug)]
pub enum Grab<'a> {
    Ready(&'a RgbImage),
    NotReady,
}

/// Per-source counters for health logging.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_decoded: u64,
    pub location: String,
}

/// A media source owned by the session for its active lifetime.
pub enum FrameSource {
    LiveCamera(CameraSource),
    FileVideo(FileVideoSource),
}

impl FrameSource {
    /// Open the source described by `spec`. Fails with the fault the backend reports.
    pub fn open(spec: &SourceSpec) -> Result<Self, SourceFault> {
        match spec {
            SourceSpec::Camera(config) => {
                let mut camera = CameraSource::new(config.clone());
                camera.open()?;
                Ok(Self::LiveCamera(camera))
            }
            SourceSpec::File(config) => {
                let video = FileVideoSource::open(config.clone())?;
                Ok(Self::FileVideo(video))
            }
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::LiveCamera(_) => SourceKind::LiveCamera,
            Self::FileVideo(_) => SourceKind::FileVideo,
        }
    }

    /// Decoded resolution; known once the backend has negotiated it.
    pub fn native_size(&self) -> Option<Size> {
        match self {
            Self::LiveCamera(source) => source.native_size(),
            Self::FileVideo(source) => source.native_size(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::LiveCamera(source) => source.is_ready(),
            Self::FileVideo(source) => source.is_ready(),
        }
    }

    /// Natural end of playback. Live cameras never end.
    pub fn has_ended(&self) -> bool {
        match self {
            Self::LiveCamera(_) => false,
            Self::FileVideo(source) => source.has_ended(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::LiveCamera(source) => source.is_open(),
            Self::FileVideo(source) => source.is_open(),
        }
    }

    /// Pump the backend once. Cheap when nothing is due.
    pub fn advance(&mut self, now: Instant) -> Result<(), SourceFault> {
        match self {
            Self::LiveCamera(source) => source.advance(),
            Self::FileVideo(source) => source.advance(now),
        }
    }

    pub fn grab_frame(&self) -> Grab<'_> {
        let frame = match self {
            Self::LiveCamera(source) => source.current_frame(),
            Self::FileVideo(source) => source.current_frame(),
        };
        match frame {
            Some(frame) if self.is_ready() => Grab::Ready(frame),
            _ => Grab::NotReady,
        }
    }

    /// Latest decoded frame for display, ready or not.
    pub fn display_frame(&self) -> Option<&RgbImage> {
        match self {
            Self::LiveCamera(source) => source.current_frame(),
            Self::FileVideo(source) => source.current_frame(),
        }
    }

    /// Make the source produce frames: opens camera tracks or starts playback.
    pub fn resume(&mut self) -> Result<(), SourceFault> {
        match self {
            Self::LiveCamera(source) => source.open(),
            Self::FileVideo(source) => {
                source.play();
                Ok(())
            }
        }
    }

    /// Stop producing frames, scoped to the source type: cameras release their
    /// tracks, files pause in place. Returns true if anything was released.
    pub fn halt(&mut self) -> bool {
        match self {
            Self::LiveCamera(source) => source.close(),
            Self::FileVideo(source) => source.pause(),
        }
    }

    /// Release every resource the source holds. Idempotent.
    pub fn close(&mut self) -> bool {
        match self {
            Self::LiveCamera(source) => source.close(),
            Self::FileVideo(source) => source.close(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match self {
            Self::LiveCamera(source) => source.stats(),
            Self::FileVideo(source) => source.stats(),
        }
    }
}

/// Deterministic test pattern shared by the synthetic backends.
pub(crate) fn synthetic_frame(size: Size, frame_index: u64) -> RgbImage {
    let shift = (frame_index % 256) as u32;
    RgbImage::from_fn(size.width, size.height, |x, y| {
        image::Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift) % 256) as u8,
            ((x ^ y) % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_camera() -> SourceSpec {
        SourceSpec::Camera(CameraConfig {
            device: "stub://front".to_string(),
            ..CameraConfig::default()
        })
    }

    #[test]
    fn grab_waits_for_two_decoded_frames() {
        let mut source = FrameSource::open(&stub_camera()).unwrap();
        let now = Instant::now();
        assert!(matches!(source.grab_frame(), Grab::NotReady));
        source.advance(now).unwrap();
        assert!(matches!(source.grab_frame(), Grab::NotReady));
        source.advance(now).unwrap();
        assert!(matches!(source.grab_frame(), Grab::Ready(_)));
    }

    #[test]
    fn camera_halt_releases_tracks_once() {
        let mut source = FrameSource::open(&stub_camera()).unwrap();
        assert!(source.halt());
        assert!(!source.halt());
        assert!(!source.close());
        assert!(!source.is_open());
        assert!(!source.has_ended());
    }

    #[test]
    fn synthetic_frames_change_over_time() {
        let size = Size::new(8, 8);
        assert_ne!(synthetic_frame(size, 0), synthetic_frame(size, 1));
    }
}
