//! Session lifecycle manager.
//!
//! A `Session` owns the active frame source, the ROI editor, the flow
//! controller and the renderer. Front ends drive it with user actions
//! (`switch_mode`, ROI pointer events, `start_streaming`, `stop_streaming`)
//! and one `tick` per scheduler beat.
//!
//! Ordering rules:
//! - At most one frame source is open. A mode switch stops streaming and closes
//!   the previous source before the new one is opened.
//! - ROI editing and streaming are mutually exclusive.
//! - `teardown` releases everything in a fixed order and is idempotent.

use std::time::{Duration, Instant};

use image::RgbaImage;
use url::Url;

use crate::capture::FrameEncoder;
use crate::detect::DetectionSnapshot;
use crate::error::{Notice, PipelineError, PipelineResult, SourceFault};
use crate::flow::{FlowController, FlowStats, StreamState};
use crate::geometry::{scale, Point, Rect, Size};
use crate::ingest::{FrameSource, SourceKind, SourceSpec};
use crate::overlay::{LabelFont, OverlayInputs, OverlayPlan, OverlayRenderer, FRESHNESS_WINDOW};
use crate::roi::{RoiEditor, Viewport};
use crate::transport::{ConnectParams, Connector};

/// Fixed per-session parameters, usually built from `ClientConfig`.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub endpoint: Url,
    pub confidence: f32,
    pub model: String,
    pub token: Option<String>,
    pub display: Size,
    pub freshness: Duration,
    pub encoder: FrameEncoder,
    /// Without a font, labels are painted as blank plates.
    pub font: Option<LabelFont>,
}

impl SessionSettings {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            confidence: 0.5,
            model: "yolo".to_string(),
            token: None,
            display: Size::new(1280, 720),
            freshness: FRESHNESS_WINDOW,
            encoder: FrameEncoder::default(),
            font: None,
        }
    }
}

/// What a `teardown` call actually released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub stopped_stream: bool,
    pub halted_render: bool,
    pub released_source: bool,
}

impl TeardownReport {
    pub fn is_noop(&self) -> bool {
        !(self.stopped_stream || self.halted_render || self.released_source)
    }
}

pub struct Session {
    settings: SessionSettings,
    connector: Box<dyn Connector>,
    source: Option<FrameSource>,
    roi: RoiEditor,
    flow: FlowController,
    renderer: OverlayRenderer,
    render_active: bool,
    notices: Vec<Notice>,
}

impl Session {
    pub fn new(settings: SessionSettings, connector: Box<dyn Connector>) -> Self {
        let flow = FlowController::new(settings.encoder);
        let renderer = OverlayRenderer::new(settings.display, settings.freshness)
            .with_font(settings.font.clone());
        Self {
            settings,
            connector,
            source: None,
            roi: RoiEditor::new(),
            flow,
            renderer,
            render_active: false,
            notices: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn stream_state(&self) -> StreamState {
        self.flow.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.flow.is_active()
    }

    pub fn is_rendering(&self) -> bool {
        self.render_active
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        self.source.as_ref().map(FrameSource::kind)
    }

    pub fn source(&self) -> Option<&FrameSource> {
        self.source.as_ref()
    }

    pub fn snapshot(&self) -> Option<&DetectionSnapshot> {
        self.flow.snapshot()
    }

    pub fn flow_stats(&self) -> FlowStats {
        self.flow.stats()
    }

    /// Capture-to-reply latency of the last answered frame.
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.flow.last_round_trip()
    }

    pub fn roi(&self) -> &RoiEditor {
        &self.roi
    }

    /// Take every notice raised since the last call.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Switch to the source described by `spec`.
    ///
    /// Streaming is stopped and the previous source released before the new
    /// one is opened. A committed ROI follows the new native resolution.
    pub fn switch_mode(&mut self, spec: &SourceSpec) -> PipelineResult<()> {
        let previous_native = self.release_active_source();
        self.roi.cancel();

        let source = match FrameSource::open(spec) {
            Ok(source) => source,
            Err(fault) => return self.reject(fault.into()),
        };
        if let (Some(from), Some(to)) = (previous_native, source.native_size()) {
            if from != to {
                self.roi.rescale(from, to);
            }
        }
        log::info!(
            "session: {} source active ({})",
            source.kind(),
            source
                .native_size()
                .map(|size| size.to_string())
                .unwrap_or_else(|| "size pending".to_string())
        );
        self.source = Some(source);
        self.render_active = true;
        Ok(())
    }

    /// Enter ROI editing. Rejected while a stream is running.
    pub fn begin_roi_edit(&mut self) -> PipelineResult<()> {
        if self.flow.is_active() {
            return self.reject(PipelineError::StateConflict(
                "stop streaming before editing the danger zone".to_string(),
            ));
        }
        let viewport = self.viewport();
        self.roi.start(viewport);
        Ok(())
    }

    pub fn roi_pointer_down(&mut self, at: Point) -> PipelineResult<()> {
        match self.roi.begin_draw(at) {
            Ok(()) => Ok(()),
            Err(err) => self.reject(err),
        }
    }

    pub fn roi_pointer_move(&mut self, at: Point) {
        self.roi.update_draw(at);
    }

    /// Finish the drag. Returns the committed ROI in native space.
    pub fn roi_pointer_up(&mut self) -> PipelineResult<Rect> {
        match self.roi.commit() {
            Ok(roi) => {
                log::info!(
                    "session: danger zone set to {:.0},{:.0} {:.0}x{:.0}",
                    roi.x,
                    roi.y,
                    roi.width,
                    roi.height
                );
                Ok(roi)
            }
            Err(err) => self.reject(err),
        }
    }

    pub fn cancel_roi_edit(&mut self) {
        self.roi.cancel();
    }

    pub fn clear_roi(&mut self) {
        if self.roi.committed().is_some() {
            log::info!("session: danger zone cleared");
        }
        self.roi.clear();
    }

    /// Set the committed ROI directly, in display units. Leaves editing mode
    /// whatever the outcome.
    pub fn set_roi_display(&mut self, rect: Rect) -> PipelineResult<Rect> {
        self.begin_roi_edit()?;
        self.roi_pointer_down(Point::new(rect.x, rect.y))?;
        self.roi_pointer_move(Point::new(rect.right(), rect.bottom()));
        let committed = self.roi_pointer_up();
        if committed.is_err() {
            self.roi.cancel();
        }
        committed
    }

    /// Start streaming the active source to the detection endpoint.
    pub fn start_streaming(&mut self) -> PipelineResult<()> {
        if self.roi.is_editing() {
            return self.reject(PipelineError::StateConflict(
                "finish editing the danger zone before streaming".to_string(),
            ));
        }
        if self.flow.is_active() {
            return self.reject(PipelineError::StateConflict(
                "a stream is already running".to_string(),
            ));
        }
        let Some(source) = self.source.as_mut() else {
            return self.reject(SourceFault::NotOpen.into());
        };
        if let Err(fault) = source.resume() {
            return self.reject(fault.into());
        }

        let roi = match (self.roi.committed(), source.native_size()) {
            (Some(roi), Some(native)) => {
                Some(scale(roi, native, self.settings.encoder.frame_size(native)))
            }
            (roi, None) => roi,
            (None, _) => None,
        };
        let params = ConnectParams {
            endpoint: self.settings.endpoint.clone(),
            confidence: self.settings.confidence,
            model: self.settings.model.clone(),
            roi,
            token: self.settings.token.clone(),
        };

        self.render_active = true;
        if let Err(err) = self.flow.start(self.connector.as_mut(), &params) {
            // Same as a stream failure: files pause, cameras keep their feed.
            if let Some(source) = self.source.as_mut() {
                if source.kind() == SourceKind::FileVideo {
                    source.halt();
                }
            }
            self.notices.push(Notice::Error(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Stop streaming. Files pause in place and keep rendering; cameras release
    /// their tracks and rendering stops.
    pub fn stop_streaming(&mut self) -> bool {
        let stopped = self.flow.stop(self.source.as_mut());
        if stopped {
            self.render_active = self.source_is_open();
        }
        stopped
    }

    /// One scheduler beat: pump the source, run the flow controller and plan
    /// the overlay. Returns `None` while rendering is halted.
    pub fn tick(&mut self, now: Instant) -> Option<OverlayPlan> {
        if let Some(source) = self.source.as_mut() {
            if let Err(fault) = source.advance(now) {
                let err = PipelineError::from(fault);
                log::error!("session: source failed: {}", err);
                self.flow.stop(Some(source));
                source.close();
                self.notices.push(Notice::Error(err));
            }
            let notices = self.flow.tick(source, now);
            self.notices.extend(notices);
        }
        // Stream failures leave rendering on; the overlay just goes away.
        if !self.render_active {
            return None;
        }
        Some(self.plan(now))
    }

    /// Plan for the current state without advancing anything.
    pub fn plan(&self, now: Instant) -> OverlayPlan {
        let inputs = OverlayInputs {
            native: self
                .source
                .as_ref()
                .filter(|source| source.display_frame().is_some())
                .and_then(FrameSource::native_size),
            committed_roi: self.roi.committed(),
            draft_roi: self.roi.draft(),
            snapshot: self.flow.snapshot(),
        };
        self.renderer.plan(&inputs, now)
    }

    /// Rasterize a plan onto a fresh display surface.
    pub fn paint(&self, plan: &OverlayPlan) -> RgbaImage {
        let frame = self.source.as_ref().and_then(FrameSource::display_frame);
        self.renderer.paint(plan, frame)
    }

    /// Release everything: stream, render loop, then source. Safe to call in
    /// any state and any number of times.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            stopped_stream: self.flow.stop(self.source.as_mut()),
            ..Default::default()
        };
        report.halted_render = std::mem::replace(&mut self.render_active, false);
        self.roi.cancel();
        if let Some(mut source) = self.source.take() {
            let stats = source.stats();
            // Streaming stop may already have released camera tracks.
            source.close();
            report.released_source = true;
            log::info!(
                "session: released {} source {} after {} frames",
                source.kind(),
                stats.location,
                stats.frames_decoded
            );
        }
        if !report.is_noop() {
            let stats = self.flow.stats();
            log::info!(
                "session: torn down (sent={} replies={})",
                stats.frames_sent,
                stats.replies
            );
        }
        report
    }

    fn release_active_source(&mut self) -> Option<Size> {
        self.flow.stop(self.source.as_mut());
        self.render_active = false;
        let mut source = self.source.take()?;
        let native = source.native_size();
        source.close();
        native
    }

    fn source_is_open(&self) -> bool {
        self.source.as_ref().map_or(false, FrameSource::is_open)
    }

    fn viewport(&self) -> Viewport {
        let display = self.renderer.display();
        let native = self
            .source
            .as_ref()
            .and_then(FrameSource::native_size)
            .unwrap_or(display);
        Viewport::new(display, native)
    }

    /// Surface a rejected action and hand the error back to the caller.
    fn reject<T>(&mut self, err: PipelineError) -> PipelineResult<T> {
        log::warn!("session: {}", err);
        self.notices.push(Notice::Warning(err.clone()));
        Err(err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CameraConfig, FileVideoConfig};
    use crate::transport::MemoryLink;

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::new(Url::parse("ws://localhost/ws").unwrap());
        settings.display = Size::new(640, 480);
        settings
    }

    fn camera(device: &str) -> SourceSpec {
        SourceSpec::Camera(CameraConfig {
            device: device.to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
        })
    }

    fn file(path: &str) -> SourceSpec {
        SourceSpec::File(FileVideoConfig {
            path: path.to_string(),
            fps: 0,
        })
    }

    #[test]
    fn mode_switch_closes_previous_source_first() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session.switch_mode(&camera("stub://a")).unwrap();
        session.start_streaming().unwrap();
        session.tick(Instant::now());
        assert!(session.is_streaming());

        session
            .switch_mode(&file("stub://clip?frames=10&width=320&height=240"))
            .unwrap();
        assert_eq!(session.stream_state(), StreamState::Stopped);
        assert_eq!(link.close_count(), 1);
        assert_eq!(session.source_kind(), Some(SourceKind::FileVideo));
    }

    #[test]
    fn failed_open_is_reported_and_leaves_no_source() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        let err = session.switch_mode(&camera("stub://denied")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SourceUnavailable(SourceFault::PermissionDenied(_))
        ));
        assert!(session.source().is_none());
        assert_eq!(session.drain_notices(), vec![Notice::Warning(err)]);
    }

    #[test]
    fn editing_and_streaming_are_exclusive() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session.switch_mode(&camera("stub://a")).unwrap();

        session.begin_roi_edit().unwrap();
        assert!(matches!(
            session.start_streaming(),
            Err(PipelineError::StateConflict(_))
        ));
        session.cancel_roi_edit();

        session.start_streaming().unwrap();
        assert!(matches!(
            session.begin_roi_edit(),
            Err(PipelineError::StateConflict(_))
        ));
        assert_eq!(link.connects().len(), 1);
    }

    #[test]
    fn roi_is_sent_in_encoded_frame_space() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session
            .switch_mode(&SourceSpec::Camera(CameraConfig {
                device: "stub://wide".to_string(),
                width: 1280,
                height: 960,
                target_fps: 30,
            }))
            .unwrap();
        // display 640x480 over native 1280x960
        let native = session
            .set_roi_display(Rect::new(10.0, 20.0, 100.0, 50.0))
            .unwrap();
        assert_eq!(native, Rect::new(20.0, 40.0, 200.0, 100.0));

        session.start_streaming().unwrap();
        let params = &link.connects()[0];
        // encoded at 640 wide, which matches the display here
        assert_eq!(params.roi, Some(Rect::new(10.0, 20.0, 100.0, 50.0)));
    }

    #[test]
    fn start_without_source_is_rejected() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        assert_eq!(
            session.start_streaming(),
            Err(PipelineError::SourceUnavailable(SourceFault::NotOpen))
        );
        assert!(link.connects().is_empty());
    }

    #[test]
    fn stopping_a_camera_halts_rendering() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session.switch_mode(&camera("stub://a")).unwrap();
        assert!(session.tick(Instant::now()).is_some());
        session.start_streaming().unwrap();
        assert!(session.stop_streaming());
        assert!(!session.is_rendering());
        assert!(session.tick(Instant::now()).is_none());
        assert!(!session.stop_streaming());
    }

    #[test]
    fn stopping_a_file_pauses_and_keeps_rendering() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session.switch_mode(&file("stub://clip?frames=50")).unwrap();
        session.start_streaming().unwrap();
        session.tick(Instant::now());
        assert!(session.stop_streaming());
        assert!(session.is_rendering());
        assert!(session.tick(Instant::now()).is_some());
    }

    #[test]
    fn teardown_twice_releases_once() {
        let link = MemoryLink::new();
        let mut session = Session::new(settings(), Box::new(link.connector()));
        session.switch_mode(&camera("stub://a")).unwrap();
        session.start_streaming().unwrap();

        let first = session.teardown();
        assert_eq!(
            first,
            TeardownReport {
                stopped_stream: true,
                halted_render: true,
                released_source: true,
            }
        );
        assert!(session.teardown().is_noop());
        assert_eq!(link.close_count(), 1);
    }
}
