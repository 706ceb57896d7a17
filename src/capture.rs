//! Frame capture and JPEG encoding.
//!
//! Each streaming cycle samples the source's current frame, downsamples it to a
//! bounded width and compresses it. Quality is deliberately low: a small
//! payload keeps the round trip short, which matters more for a live overlay
//! than fine detail does.

use std::time::Instant;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

use crate::geometry::Size;
use crate::ingest::{FrameSource, Grab};

pub const DEFAULT_ENCODE_WIDTH: u32 = 640;
pub const DEFAULT_JPEG_QUALITY: u8 = 60;

/// A compressed frame ready for the channel. Not retained after sending.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub captured_at: Instant,
    /// Resolution the source decoded at.
    pub native_size: Size,
    /// Resolution of the compressed image; detections come back in this space.
    pub frame_size: Size,
}

impl EncodedFrame {
    pub fn to_data_uri(&self) -> String {
        format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(&self.jpeg))
    }
}

#[derive(Debug)]
pub enum Capture {
    Frame(EncodedFrame),
    NotReady,
}

#[derive(Clone, Copy, Debug)]
pub struct FrameEncoder {
    target_width: u32,
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_ENCODE_WIDTH, DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder {
    pub fn new(target_width: u32, quality: u8) -> Self {
        Self {
            target_width: target_width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Size an image of `native` resolution is encoded at.
    pub fn frame_size(&self, native: Size) -> Size {
        native.fit_width(self.target_width)
    }

    /// Sample and encode the source's current frame.
    ///
    /// Returns `Capture::NotReady` without retrying when the source has not
    /// decoded enough data yet; the caller picks the retry tick.
    pub fn capture(&self, source: &FrameSource) -> Result<Capture> {
        let frame = match source.grab_frame() {
            Grab::Ready(frame) => frame,
            Grab::NotReady => return Ok(Capture::NotReady),
        };
        let captured_at = Instant::now();
        self.encode(frame, captured_at).map(Capture::Frame)
    }

    pub fn encode(&self, frame: &RgbImage, captured_at: Instant) -> Result<EncodedFrame> {
        let native_size = Size::new(frame.width(), frame.height());
        let frame_size = self.frame_size(native_size);

        let mut jpeg = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
            if frame_size == native_size {
                encoder
                    .encode_image(frame)
                    .context("encode frame as jpeg")?;
            } else {
                let resized = image::imageops::resize(
                    frame,
                    frame_size.width,
                    frame_size.height,
                    FilterType::Triangle,
                );
                encoder
                    .encode_image(&resized)
                    .context("encode downscaled frame as jpeg")?;
            }
        }

        Ok(EncodedFrame {
            jpeg,
            captured_at,
            native_size,
            frame_size,
        })
    }
}
