//! Detection overlay renderer.
//!
//! Rendering runs every tick regardless of network state. Each tick builds an
//! `OverlayPlan` (ordered draw operations in display space) from the current
//! frame, the ROI editor and the latest detection snapshot; `paint` rasterizes
//! a plan onto an RGBA surface with `imageproc`, using a TrueType font for
//! label text when one is available.
//!
//! Detections are scaled from the encoded frame space they were computed in to
//! display space. ROI membership is judged in native space by box center.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{Rgba, RgbaImage, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size, Blend,
};
use imageproc::rect::Rect as PixelRect;

use crate::detect::{BoundingBox, DetectionSnapshot};
use crate::geometry::{contains, scale, Point, Rect, Size};

/// Snapshots older than this are not drawn.
pub const FRESHNESS_WINDOW: Duration = Duration::from_millis(500);

pub const ROI_LABEL: &str = "DANGER ZONE";
pub const IN_ZONE_MARKER: &str = "[IN ZONE]";

const ROI_FILL: Rgba<u8> = Rgba([255, 0, 0, 48]);
const ROI_BORDER: Rgba<u8> = Rgba([255, 0, 0, 255]);
const DRAFT_FILL: Rgba<u8> = Rgba([255, 255, 255, 32]);
const DRAFT_BORDER: Rgba<u8> = Rgba([255, 255, 255, 200]);
pub const IN_ZONE_COLOR: Rgba<u8> = Rgba([255, 32, 32, 255]);
pub const OUT_OF_ZONE_COLOR: Rgba<u8> = Rgba([255, 176, 0, 255]);

const BORDER_PX: u32 = 2;
const BOX_PX: u32 = 3;
const LABEL_HEIGHT: u32 = 16;
const LABEL_PAD: u32 = 2;
const LABEL_TEXT_PX: f32 = 13.0;
const LABEL_TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// Approximate advance of one label glyph, used to size plates without a font.
const GLYPH_WIDTH: u32 = 7;
/// Coordinates beyond this are clamped before rasterizing.
const PIXEL_LIMIT: f32 = 100_000.0;

/// Fonts tried, in order, when none is configured.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu-sans-fonts/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
];

/// TrueType font used to rasterize label text.
#[derive(Clone)]
pub struct LabelFont {
    font: FontArc,
    origin: PathBuf,
}

impl LabelFont {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read label font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| anyhow!("invalid label font {}: {}", path.display(), e))?;
        Ok(Self {
            font,
            origin: path.to_path_buf(),
        })
    }

    /// First usable font from the usual system locations.
    pub fn discover() -> Option<Self> {
        SYSTEM_FONTS
            .iter()
            .map(Path::new)
            .filter(|path| path.is_file())
            .find_map(|path| match Self::load(path) {
                Ok(font) => Some(font),
                Err(err) => {
                    log::debug!("skipping label font: {:#}", err);
                    None
                }
            })
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

impl fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelFont")
            .field("origin", &self.origin)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DrawOp {
    /// The source frame, stretched from its native size over the canvas.
    Frame { native: Size },
    FillRect { rect: Rect, color: Rgba<u8> },
    StrokeRect {
        rect: Rect,
        color: Rgba<u8>,
        thickness: u32,
    },
    /// Text on a solid plate whose bottom-left corner sits at `anchor`.
    Label {
        anchor: Point,
        text: String,
        color: Rgba<u8>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayPlan {
    pub canvas: Size,
    pub ops: Vec<DrawOp>,
}

impl OverlayPlan {
    pub fn labels(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::Label { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Stroke colors of detection boxes, in draw order.
    pub fn box_colors(&self) -> Vec<Rgba<u8>> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::StrokeRect {
                    color, thickness, ..
                } if *thickness == BOX_PX => Some(*color),
                _ => None,
            })
            .collect()
    }
}

/// Everything one render tick reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct OverlayInputs<'a> {
    /// Native size of the active source's current frame; `None` when no frame is available.
    pub native: Option<Size>,
    /// Committed ROI in native space.
    pub committed_roi: Option<Rect>,
    /// In-progress ROI draft in display space.
    pub draft_roi: Option<Rect>,
    pub snapshot: Option<&'a DetectionSnapshot>,
}

#[derive(Clone, Debug)]
pub struct OverlayRenderer {
    display: Size,
    freshness: Duration,
    font: Option<LabelFont>,
}

impl OverlayRenderer {
    pub fn new(display: Size, freshness: Duration) -> Self {
        Self {
            display,
            freshness,
            font: None,
        }
    }

    pub fn with_font(mut self, font: Option<LabelFont>) -> Self {
        self.font = font;
        self
    }

    pub fn font(&self) -> Option<&LabelFont> {
        self.font.as_ref()
    }

    pub fn display(&self) -> Size {
        self.display
    }

    pub fn set_display(&mut self, display: Size) {
        self.display = display;
    }

    pub fn plan(&self, inputs: &OverlayInputs<'_>, now: Instant) -> OverlayPlan {
        let mut ops = Vec::new();
        let native = inputs.native.unwrap_or(self.display);

        if let Some(native) = inputs.native {
            ops.push(DrawOp::Frame { native });
        }

        // A drag in progress replaces the committed zone on screen.
        match inputs.draft_roi {
            Some(draft) => {
                ops.push(DrawOp::FillRect {
                    rect: draft,
                    color: DRAFT_FILL,
                });
                ops.push(DrawOp::StrokeRect {
                    rect: draft,
                    color: DRAFT_BORDER,
                    thickness: BORDER_PX,
                });
            }
            None => {
                if let Some(roi) = inputs.committed_roi {
                    let rect = scale(roi, native, self.display);
                    ops.push(DrawOp::FillRect {
                        rect,
                        color: ROI_FILL,
                    });
                    ops.push(DrawOp::StrokeRect {
                        rect,
                        color: ROI_BORDER,
                        thickness: BORDER_PX,
                    });
                    ops.push(DrawOp::Label {
                        anchor: Point::new(rect.x, rect.y),
                        text: ROI_LABEL.to_string(),
                        color: ROI_BORDER,
                    });
                }
            }
        }

        if let Some(snapshot) = inputs.snapshot {
            if snapshot.is_fresh(now, self.freshness) {
                for bbox in snapshot.boxes() {
                    self.plan_box(&mut ops, bbox, snapshot, inputs.committed_roi);
                }
            }
        }

        OverlayPlan {
            canvas: self.display,
            ops,
        }
    }

    fn plan_box(
        &self,
        ops: &mut Vec<DrawOp>,
        bbox: &BoundingBox,
        snapshot: &DetectionSnapshot,
        roi: Option<Rect>,
    ) {
        let in_zone = roi.map_or(false, |zone| {
            let native_box = scale(bbox.rect(), snapshot.frame_size(), snapshot.native_size());
            contains(&zone, &native_box)
        });
        let color = if in_zone {
            IN_ZONE_COLOR
        } else {
            OUT_OF_ZONE_COLOR
        };
        let rect = scale(bbox.rect(), snapshot.frame_size(), self.display);
        ops.push(DrawOp::StrokeRect {
            rect,
            color,
            thickness: BOX_PX,
        });
        ops.push(DrawOp::Label {
            anchor: Point::new(rect.x, rect.y),
            text: detection_label(bbox, in_zone),
            color,
        });
    }

    /// Rasterize `plan`. Without a frame the background stays black.
    pub fn paint(&self, plan: &OverlayPlan, frame: Option<&RgbImage>) -> RgbaImage {
        let canvas = plan.canvas;
        let mut surface = RgbaImage::from_pixel(canvas.width, canvas.height, Rgba([0, 0, 0, 255]));

        for op in &plan.ops {
            match op {
                DrawOp::Frame { .. } => {
                    if let Some(frame) = frame {
                        paint_frame(&mut surface, frame);
                    }
                }
                DrawOp::FillRect { rect, color } => fill_rect(&mut surface, *rect, *color),
                DrawOp::StrokeRect {
                    rect,
                    color,
                    thickness,
                } => stroke_rect(&mut surface, *rect, *color, *thickness),
                DrawOp::Label {
                    anchor,
                    text,
                    color,
                } => self.paint_label(&mut surface, *anchor, text, *color),
            }
        }
        surface
    }

    /// Solid plate above `anchor` with the text on top.
    fn paint_label(&self, surface: &mut RgbaImage, anchor: Point, text: &str, color: Rgba<u8>) {
        let scale = PxScale::from(LABEL_TEXT_PX);
        let text_width = match &self.font {
            Some(font) => text_size(scale, &font.font, text).0,
            None => text.chars().count() as u32 * GLYPH_WIDTH,
        };
        let plate = Rect::new(
            anchor.x,
            (anchor.y - LABEL_HEIGHT as f32).max(0.0),
            (text_width + 2 * LABEL_PAD) as f32,
            LABEL_HEIGHT as f32,
        );
        fill_rect(surface, plate, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                surface,
                LABEL_TEXT_COLOR,
                (plate.x + LABEL_PAD as f32) as i32,
                (plate.y + 1.0) as i32,
                scale,
                &font.font,
                text,
            );
        }
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(Size::new(1280, 720), FRESHNESS_WINDOW)
    }
}

/// "knife 82%", plus the zone marker when the box center is inside the ROI.
pub fn detection_label(bbox: &BoundingBox, in_zone: bool) -> String {
    let mut label = format!("{} {}%", bbox.class_name, bbox.confidence_percent());
    if in_zone {
        label.push(' ');
        label.push_str(IN_ZONE_MARKER);
    }
    label
}

fn paint_frame(surface: &mut RgbaImage, frame: &RgbImage) {
    let (width, height) = surface.dimensions();
    let resized;
    let source = if frame.dimensions() == (width, height) {
        frame
    } else {
        resized = image::imageops::resize(frame, width, height, FilterType::Triangle);
        &resized
    };
    for (x, y, pixel) in source.enumerate_pixels() {
        surface.put_pixel(x, y, Rgba([pixel[0], pixel[1], pixel[2], 255]));
    }
}

/// Smallest pixel rectangle covering `rect`; `None` when it has no area.
fn pixel_rect(rect: Rect) -> Option<PixelRect> {
    let x0 = rect.x.floor().clamp(-PIXEL_LIMIT, PIXEL_LIMIT);
    let y0 = rect.y.floor().clamp(-PIXEL_LIMIT, PIXEL_LIMIT);
    let x1 = rect.right().ceil().clamp(-PIXEL_LIMIT, PIXEL_LIMIT);
    let y1 = rect.bottom().ceil().clamp(-PIXEL_LIMIT, PIXEL_LIMIT);
    (x1 > x0 && y1 > y0)
        .then(|| PixelRect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}

fn is_opaque(color: Rgba<u8>) -> bool {
    color[3] == u8::MAX
}

fn fill_rect(surface: &mut RgbaImage, rect: Rect, color: Rgba<u8>) {
    let Some(area) = pixel_rect(rect) else {
        return;
    };
    if is_opaque(color) {
        draw_filled_rect_mut(surface, area, color);
    } else {
        let mut canvas = Blend(std::mem::take(surface));
        draw_filled_rect_mut(&mut canvas, area, color);
        *surface = canvas.0;
    }
}

/// `thickness` nested one-pixel outlines, growing inward from `rect`.
fn stroke_rect(surface: &mut RgbaImage, rect: Rect, color: Rgba<u8>, thickness: u32) {
    let rings: Vec<PixelRect> = (0..thickness)
        .map(|inset| inset as f32)
        .map(|inset| {
            Rect::new(
                rect.x + inset,
                rect.y + inset,
                rect.width - 2.0 * inset,
                rect.height - 2.0 * inset,
            )
        })
        .take_while(|ring| ring.width >= 1.0 && ring.height >= 1.0)
        .filter_map(pixel_rect)
        .collect();
    if is_opaque(color) {
        for ring in rings {
            draw_hollow_rect_mut(surface, ring, color);
        }
    } else {
        let mut canvas = Blend(std::mem::take(surface));
        for ring in rings {
            draw_hollow_rect_mut(&mut canvas, ring, color);
        }
        *surface = canvas.0;
    }
}
