//! Restricted-zone (ROI) editor.
//!
//! Pointer input arrives in display units. The draft lives in display space so
//! the minimum-size rule is judged against what the user actually sees; the
//! committed ROI is stored in native source space, the same space detections
//! are evaluated in, and scaled only for drawing.

use crate::error::{PipelineError, PipelineResult};
use crate::geometry::{scale, Point, Rect, Size};

/// Minimum accepted ROI side, in display units.
pub const MIN_ROI_SIDE: u32 = 30;

/// Display and native sizes the editor converts between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub display: Size,
    pub native: Size,
}

impl Viewport {
    pub fn new(display: Size, native: Size) -> Self {
        Self { display, native }
    }

    pub fn to_native(&self, display_rect: Rect) -> Rect {
        scale(display_rect, self.display, self.native)
    }

    pub fn to_display(&self, native_rect: Rect) -> Rect {
        scale(native_rect, self.native, self.display)
    }
}

#[derive(Debug, Default)]
pub struct RoiEditor {
    editing: bool,
    viewport: Option<Viewport>,
    anchor: Option<Point>,
    draft: Option<Rect>,
    committed: Option<Rect>,
}

impl RoiEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter editing mode. Any stale draft is dropped.
    pub fn start(&mut self, viewport: Viewport) {
        self.editing = true;
        self.viewport = Some(viewport);
        self.anchor = None;
        self.draft = None;
    }

    /// Leave editing mode without touching the committed ROI.
    pub fn cancel(&mut self) {
        self.editing = false;
        self.anchor = None;
        self.draft = None;
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    /// True while a drag is in progress.
    pub fn is_drafting(&self) -> bool {
        self.draft.is_some()
    }

    pub fn begin_draw(&mut self, origin: Point) -> PipelineResult<()> {
        if !self.editing {
            return Err(PipelineError::StateConflict(
                "ROI editor is not active".to_string(),
            ));
        }
        self.anchor = Some(origin);
        self.draft = Some(Rect::new(origin.x, origin.y, 0.0, 0.0));
        Ok(())
    }

    /// Recompute the draft from the drag anchor to `current`.
    pub fn update_draw(&mut self, current: Point) {
        if let Some(anchor) = self.anchor {
            self.draft = Some(Rect::from_corners(anchor, current));
        }
    }

    /// Promote the draft to the committed ROI.
    ///
    /// An undersized draft is discarded and the editor stays in editing mode so
    /// the user can drag again. A successful commit ends editing and returns the
    /// committed ROI in native space.
    pub fn commit(&mut self) -> PipelineResult<Rect> {
        self.anchor = None;
        let draft = self.draft.take().unwrap_or_default();
        let min = MIN_ROI_SIDE as f32;
        if draft.width < min || draft.height < min {
            return Err(PipelineError::SizeViolation {
                width: draft.width.round() as u32,
                height: draft.height.round() as u32,
                min: MIN_ROI_SIDE,
            });
        }
        let native = match self.viewport {
            Some(viewport) => viewport.to_native(draft),
            None => draft,
        };
        self.committed = Some(native);
        self.editing = false;
        Ok(native)
    }

    pub fn clear(&mut self) {
        self.committed = None;
    }

    /// Draft rectangle in display space.
    pub fn draft(&self) -> Option<Rect> {
        self.draft
    }

    /// Committed ROI in native space.
    pub fn committed(&self) -> Option<Rect> {
        self.committed
    }

    /// Carry the committed ROI over to a source with a different native size.
    pub fn rescale(&mut self, from: Size, to: Size) {
        if let Some(roi) = self.committed {
            self.committed = Some(scale(roi, from, to));
        }
    }

    /// Update the display/native sizes, e.g. after a resize or source switch.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }
}
