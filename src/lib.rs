//! Weapon Watch client
//!
//! This crate implements the client side of a real-time weapon-detection
//! pipeline: it captures frames from a live camera or a local video file,
//! streams them to a remote inference service, and renders the returned
//! detections as overlays on top of the video.
//!
//! # Architecture
//!
//! Everything runs on one cooperative scheduler. The front end calls
//! `Session::tick` once per beat; each tick pumps the frame source, polls the
//! duplex channel without blocking, and plans the overlay.
//!
//! 1. **One frame in flight**: the next frame is only captured after the
//!    previous one has been answered, so the server paces the client.
//! 2. **Freshest result only**: each reply replaces the detection snapshot
//!    wholesale. Snapshots older than the freshness window are not drawn.
//! 3. **One source at a time**: switching modes stops streaming and releases
//!    the previous source before opening the next.
//! 4. **Native-space ROI**: the danger zone is stored in native source
//!    resolution and scaled for display and for the server.
//!
//! # Module Structure
//!
//! - `geometry`: resolution spaces, scaling, center containment
//! - `roi`: danger zone editor
//! - `ingest`: frame sources (live camera, local file, synthetic stubs)
//! - `capture`: frame sampling and JPEG encoding
//! - `detect`: bounding boxes and the detection snapshot
//! - `transport`: wire protocol, duplex channel trait, WebSocket and in-memory channels
//! - `flow`: ping-pong streaming state machine
//! - `overlay`: overlay planning and rasterization (imageproc, ab_glyph labels)
//! - `session`: lifecycle and teardown ordering
//! - `config`: client configuration (file + environment)

pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod flow;
pub mod geometry;
pub mod ingest;
pub mod overlay;
pub mod roi;
pub mod session;
pub mod transport;

pub use capture::{Capture, EncodedFrame, FrameEncoder};
pub use config::{ClientConfig, DetectionModel};
pub use detect::{BoundingBox, DetectionSnapshot};
pub use error::{Notice, PipelineError, PipelineResult, SourceFault};
pub use flow::{FlowController, FlowStats, StreamState};
pub use geometry::{contains, scale, Point, Rect, Size};
pub use ingest::{
    CameraConfig, FileVideoConfig, FrameSource, Grab, SourceKind, SourceSpec, READY_FRAMES,
};
pub use overlay::{
    DrawOp, LabelFont, OverlayInputs, OverlayPlan, OverlayRenderer, FRESHNESS_WINDOW,
};
pub use roi::{RoiEditor, Viewport, MIN_ROI_SIDE};
pub use session::{Session, SessionSettings, TeardownReport};
pub use transport::{
    ChannelEvent, ConnectParams, Connector, DuplexChannel, MemoryConnector, MemoryLink,
    WsConnector,
};
