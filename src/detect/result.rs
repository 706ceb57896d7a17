use std::time::{Duration, Instant};

use crate::geometry::{Rect, Size};

/// One detected object, in the coordinate space of the frame that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_name: String,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    /// Build a box from two corners in any order; the result always has
    /// `x2 >= x1` and `y2 >= y1`. Confidence is clamped into [0, 1].
    pub fn new(
        class_name: impl Into<String>,
        confidence: f32,
        (ax, ay): (f32, f32),
        (bx, by): (f32, f32),
    ) -> Self {
        Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
            class_name: class_name.into(),
            confidence: if confidence.is_nan() {
                0.0
            } else {
                confidence.clamp(0.0, 1.0)
            },
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2 - self.x1, self.y2 - self.y1)
    }

    /// Confidence as a whole percentage, e.g. 0.82 -> 82.
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence * 100.0).round() as u32
    }
}

/// The freshest detection result known to the client.
///
/// Built once per inbound reply and never edited afterwards; a newer reply
/// replaces the whole snapshot.
#[derive(Clone, Debug)]
pub struct DetectionSnapshot {
    boxes: Vec<BoundingBox>,
    total: u32,
    processing_time: Duration,
    received_at: Instant,
    frame_size: Size,
    native_size: Size,
    server_fps: Option<f32>,
}

impl DetectionSnapshot {
    pub fn new(
        boxes: Vec<BoundingBox>,
        total: u32,
        processing_time: Duration,
        received_at: Instant,
        frame_size: Size,
        native_size: Size,
    ) -> Self {
        Self {
            boxes,
            total,
            processing_time,
            received_at,
            frame_size,
            native_size,
            server_fps: None,
        }
    }

    pub fn with_server_fps(mut self, fps: Option<f32>) -> Self {
        self.server_fps = fps;
        self
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Resolution the boxes are expressed in.
    pub fn frame_size(&self) -> Size {
        self.frame_size
    }

    /// Native resolution of the source when the frame was captured.
    pub fn native_size(&self) -> Size {
        self.native_size
    }

    pub fn server_fps(&self) -> Option<f32> {
        self.server_fps
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }

    pub fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.age(now) <= window
    }
}
