//! Coordinate scaling between resolution spaces.
//!
//! Three spaces exist in the pipeline:
//! - native: the resolution the frame source decodes at (canonical ROI space)
//! - frame: the resolution of the encoded frame sent to the server (detection space)
//! - display: the resolution of the surface the overlay is painted on
//!
//! Every conversion goes through `scale`, which treats each axis independently.

use serde::{Deserialize, Serialize};

/// Width and height of a resolution space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Size after downscaling to `target_width`, preserving aspect ratio.
    ///
    /// Never upscales; a source narrower than the target keeps its size.
    pub fn fit_width(&self, target_width: u32) -> Size {
        if self.is_degenerate() || self.width <= target_width {
            return *self;
        }
        let height = (self.height as f64 * target_width as f64 / self.width as f64).round();
        Size::new(target_width, (height as u32).max(1))
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle: top-left corner plus non-negative extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Normalized rectangle spanning two arbitrary corners.
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// Inclusive point-in-rectangle test. Degenerate rectangles contain nothing.
    pub fn contains_point(&self, p: Point) -> bool {
        if self.is_degenerate() {
            return false;
        }
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.bottom()
    }
}

/// Maps `rect` from the `from` space into the `to` space.
///
/// A degenerate `from` or `to` size leaves the rectangle unscaled.
pub fn scale(rect: Rect, from: Size, to: Size) -> Rect {
    if from.is_degenerate() || to.is_degenerate() {
        return rect;
    }
    let sx = to.width as f32 / from.width as f32;
    let sy = to.height as f32 / from.height as f32;
    Rect {
        x: rect.x * sx,
        y: rect.y * sy,
        width: rect.width * sx,
        height: rect.height * sy,
    }
}

/// True iff the center of `tested` lies within `zone` (boundary inclusive).
pub fn contains(zone: &Rect, tested: &Rect) -> bool {
    zone.contains_point(tested.center())
}
