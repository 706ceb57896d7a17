//! Local video file source.
//!
//! `FileVideoSource` plays a local file selection. It is responsible for:
//! - Rejecting anything that is not a local path (no URL fetching)
//! - Decoding frames in-memory, paced to the configured playback rate
//! - Play/pause control and an `ended` flag on natural completion
//!
//! `stub://` paths select a synthetic clip. Query parameters shape it:
//! `stub://clip?frames=90&width=640&height=360`. `stub://corrupt` fails to
//! decode like a file in an unknown container.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileDecoder;
use super::{synthetic_frame, SourceStats, READY_FRAMES};
use crate::error::SourceFault;
use crate::geometry::Size;

const SYNTHETIC_CLIP_FRAMES: u64 = 300;
const SYNTHETIC_CLIP_SIZE: Size = Size::new(1280, 720);

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileVideoConfig {
    /// Local file path (e.g., "/home/op/clips/entrance.mp4").
    pub path: String,
    /// Playback rate in frames per second. Zero decodes one frame per tick.
    pub fps: u32,
}

impl Default for FileVideoConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            fps: 30,
        }
    }
}

enum FileBackend {
    Synthetic(SyntheticClip),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileDecoder),
}

impl FileBackend {
    fn open(path: &str) -> Result<Self, SourceFault> {
        if path.starts_with("stub://") {
            return SyntheticClip::parse(path)
                .map(Self::Synthetic)
                .map_err(|err| SourceFault::UnsupportedFormat(format!("{}: {}", path, err)));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            FfmpegFileDecoder::open(path)
                .map(Self::Ffmpeg)
                .map_err(|err| SourceFault::UnsupportedFormat(format!("{:#}", err)))
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(SourceFault::UnsupportedFormat(format!(
                "{}: file decoding requires the ingest-file-ffmpeg feature",
                path
            )))
        }
    }

    fn size(&self) -> Size {
        match self {
            Self::Synthetic(clip) => clip.size,
            #[cfg(feature = "ingest-file-ffmpeg")]
            Self::Ffmpeg(decoder) => decoder.size(),
        }
    }

    /// Next decoded frame, or `None` at end of file.
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match self {
            Self::Synthetic(clip) => Ok(clip.next_frame()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Self::Ffmpeg(decoder) => decoder.next_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match self {
            Self::Synthetic(clip) => {
                clip.position = 0;
                Ok(())
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            Self::Ffmpeg(decoder) => decoder.rewind(),
        }
    }
}

pub struct FileVideoSource {
    config: FileVideoConfig,
    backend: Option<FileBackend>,
    playing: bool,
    ended: bool,
    current: Option<RgbImage>,
    decoded: u64,
    frames_total: u64,
    last_decode_at: Option<Instant>,
}

impl FileVideoSource {
    /// Open a local file and decode its first frame for display.
    pub fn open(config: FileVideoConfig) -> Result<Self, SourceFault> {
        if !is_local_file_path(&config.path) {
            return Err(SourceFault::UnsupportedFormat(
                "file playback only supports local paths (no URL schemes)".to_string(),
            ));
        }
        let backend = FileBackend::open(&config.path)?;
        log::info!(
            "FileVideoSource: opened {} ({})",
            config.path,
            backend.size()
        );
        let mut source = Self {
            config,
            backend: Some(backend),
            playing: false,
            ended: false,
            current: None,
            decoded: 0,
            frames_total: 0,
            last_decode_at: None,
        };
        source.decode_next()?;
        Ok(source)
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn native_size(&self) -> Option<Size> {
        self.backend.as_ref().map(FileBackend::size)
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some() && self.decoded >= READY_FRAMES
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Start playback. Playing an ended file restarts it from the beginning.
    pub fn play(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        if self.ended {
            if let Err(err) = backend.rewind() {
                log::warn!("FileVideoSource: rewind of {} failed: {:#}", self.config.path, err);
                return;
            }
            self.ended = false;
            self.decoded = 0;
            self.last_decode_at = None;
        }
        self.playing = true;
    }

    /// Pause in place. Returns true if playback was running.
    pub fn pause(&mut self) -> bool {
        std::mem::replace(&mut self.playing, false)
    }

    pub fn advance(&mut self, now: Instant) -> Result<(), SourceFault> {
        if !self.playing {
            return Ok(());
        }
        if let Some(last) = self.last_decode_at {
            if now.saturating_duration_since(last) < self.frame_interval() {
                return Ok(());
            }
        }
        self.last_decode_at = Some(now);
        self.decode_next()
    }

    pub fn current_frame(&self) -> Option<&RgbImage> {
        self.current.as_ref()
    }

    /// Release the decoder. Safe to call repeatedly.
    pub fn close(&mut self) -> bool {
        self.playing = false;
        self.current = None;
        self.decoded = 0;
        match self.backend.take() {
            Some(_) => {
                log::info!("FileVideoSource: closed {}", self.config.path);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_decoded: self.frames_total,
            location: self.config.path.clone(),
        }
    }

    fn decode_next(&mut self) -> Result<(), SourceFault> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let next = backend.next_frame().map_err(|err| {
            log::error!("FileVideoSource: decode of {} failed: {:#}", self.config.path, err);
            SourceFault::UnsupportedFormat(err.to_string())
        })?;
        match next {
            Some(frame) => {
                self.current = Some(frame);
                self.decoded += 1;
                self.frames_total += 1;
            }
            None => {
                if !self.ended {
                    log::info!(
                        "FileVideoSource: {} ended after {} frames",
                        self.config.path,
                        self.frames_total
                    );
                }
                self.ended = true;
                self.playing = false;
            }
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        if self.config.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.config.fps as f64)
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://)
// ----------------------------------------------------------------------------

struct SyntheticClip {
    size: Size,
    length: u64,
    position: u64,
}

impl SyntheticClip {
    fn parse(path: &str) -> Result<Self> {
        let url = url::Url::parse(path).map_err(|e| anyhow!("invalid stub path: {}", e))?;
        if url.host_str() == Some("corrupt") {
            return Err(anyhow!("no decodable video track"));
        }
        let mut clip = Self {
            size: SYNTHETIC_CLIP_SIZE,
            length: SYNTHETIC_CLIP_FRAMES,
            position: 0,
        };
        for (key, value) in url.query_pairs() {
            let parsed: u32 = value
                .parse()
                .map_err(|_| anyhow!("stub parameter {} must be an integer", key))?;
            match key.as_ref() {
                "frames" => clip.length = parsed as u64,
                "width" => clip.size.width = parsed,
                "height" => clip.size.height = parsed,
                other => return Err(anyhow!("unknown stub parameter {}", other)),
            }
        }
        Ok(clip)
    }

    fn next_frame(&mut self) -> Option<RgbImage> {
        if self.position >= self.length {
            return None;
        }
        self.position += 1;
        Some(synthetic_frame(self.size, self.position))
    }
}
