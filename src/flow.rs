//! Streaming flow controller.
//!
//! At most one frame is ever in flight. The client captures and sends a frame,
//! then waits for the server's reply (or an error) before capturing the next
//! one, so the server's reply latency paces the client and frames can never
//! pile up on either side.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Stopped
//!                                 -> Errored
//! ```
//!
//! All state lives in one `Phase` value and every transition goes through this
//! module. The next capture is armed by the reply handler and performed by the
//! scheduler tick, never from inside the reply handler itself.

use std::time::{Duration, Instant};

use crate::capture::{Capture, FrameEncoder};
use crate::detect::DetectionSnapshot;
use crate::error::{Notice, PipelineError, PipelineResult};
use crate::geometry::Size;
use crate::ingest::{FrameSource, SourceKind};
use crate::transport::{
    encode_frame_message, parse_reply, ChannelEvent, ConnectParams, Connector, DuplexChannel,
    Reply,
};

/// Upper bound on channel events handled per tick.
const MAX_EVENTS_PER_TICK: usize = 8;

/// Observable state of the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Stopped,
    Errored(PipelineError),
}

/// Why a stream was stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    VideoEnded,
    Failed,
}

/// Frame currently awaiting a reply.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    sent_at: Instant,
    frame_size: Size,
    native_size: Size,
}

enum Phase {
    Idle,
    Connecting {
        channel: Box<dyn DuplexChannel>,
    },
    Streaming {
        channel: Box<dyn DuplexChannel>,
        in_flight: Option<InFlight>,
        /// Tick number from which the next capture may run.
        capture_due: Option<u64>,
    },
    Stopped,
    Errored(PipelineError),
}

/// Per-session counters, logged when the session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub frames_sent: u64,
    pub replies: u64,
    pub server_errors: u64,
    pub deferred_captures: u64,
}

pub struct FlowController {
    phase: Phase,
    encoder: FrameEncoder,
    snapshot: Option<DetectionSnapshot>,
    ticks: u64,
    stats: FlowStats,
    last_round_trip: Option<Duration>,
}

impl FlowController {
    pub fn new(encoder: FrameEncoder) -> Self {
        Self {
            phase: Phase::Idle,
            encoder,
            snapshot: None,
            ticks: 0,
            stats: FlowStats::default(),
            last_round_trip: None,
        }
    }

    pub fn state(&self) -> StreamState {
        match &self.phase {
            Phase::Idle => StreamState::Idle,
            Phase::Connecting { .. } => StreamState::Connecting,
            Phase::Streaming { .. } => StreamState::Streaming,
            Phase::Stopped => StreamState::Stopped,
            Phase::Errored(err) => StreamState::Errored(err.clone()),
        }
    }

    /// Connecting or streaming.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            Phase::Connecting { .. } | Phase::Streaming { .. }
        )
    }

    pub fn in_flight(&self) -> bool {
        matches!(
            self.phase,
            Phase::Streaming {
                in_flight: Some(_),
                ..
            }
        )
    }

    pub fn snapshot(&self) -> Option<&DetectionSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    pub fn encoder(&self) -> &FrameEncoder {
        &self.encoder
    }

    /// Open the channel. The source must already be open and producing frames.
    pub fn start(
        &mut self,
        connector: &mut dyn Connector,
        params: &ConnectParams,
    ) -> PipelineResult<()> {
        if self.is_active() {
            return Err(PipelineError::StateConflict(
                "a stream is already running".to_string(),
            ));
        }
        self.stats = FlowStats::default();
        self.snapshot = None;
        self.last_round_trip = None;

        match connector.connect(params) {
            Ok(channel) => {
                log::info!(
                    "stream connecting (model={}, confidence={}, roi={})",
                    params.model,
                    params.confidence,
                    params.roi.is_some()
                );
                self.phase = Phase::Connecting { channel };
                Ok(())
            }
            Err(err) => {
                let err = PipelineError::ChannelError(format!("{:#}", err));
                log::error!("stream connect failed: {}", err);
                self.phase = Phase::Errored(err.clone());
                Err(err)
            }
        }
    }

    /// One scheduler tick: handle channel events, then run the capture cycle if
    /// one is due. Returns notices for the user.
    pub fn tick(&mut self, source: &mut FrameSource, now: Instant) -> Vec<Notice> {
        self.ticks += 1;
        let mut notices = Vec::new();
        if !self.is_active() {
            return notices;
        }

        for _ in 0..MAX_EVENTS_PER_TICK {
            let event = match &mut self.phase {
                Phase::Connecting { channel } | Phase::Streaming { channel, .. } => {
                    channel.poll_event()
                }
                _ => None,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_event(event, source, now, &mut notices);
        }

        self.capture_and_send(source, &mut notices);
        notices
    }

    /// Explicit stop. Closes the channel, halts the source and drops the
    /// snapshot. Returns false when there was nothing to stop.
    pub fn stop(&mut self, source: Option<&mut FrameSource>) -> bool {
        self.finish(Phase::Stopped, source, StopReason::Requested)
    }

    fn handle_event(
        &mut self,
        event: ChannelEvent,
        source: &mut FrameSource,
        now: Instant,
        notices: &mut Vec<Notice>,
    ) {
        match event {
            ChannelEvent::Opened => {
                if let Phase::Connecting { .. } = self.phase {
                    let Phase::Connecting { channel } =
                        std::mem::replace(&mut self.phase, Phase::Idle)
                    else {
                        return;
                    };
                    log::info!("stream open");
                    self.phase = Phase::Streaming {
                        channel,
                        in_flight: None,
                        capture_due: Some(self.ticks),
                    };
                }
            }
            ChannelEvent::Message(text) => self.handle_reply(&text, source, now, notices),
            ChannelEvent::Closed(reason) => {
                let err = PipelineError::ChannelError(match reason {
                    Some(reason) => format!("closed by server: {}", reason),
                    None => "closed by server".to_string(),
                });
                self.fail(err, source, notices);
            }
            ChannelEvent::Error(reason) => {
                self.fail(PipelineError::ChannelError(reason), source, notices);
            }
        }
    }

    fn handle_reply(
        &mut self,
        text: &str,
        source: &mut FrameSource,
        now: Instant,
        notices: &mut Vec<Notice>,
    ) {
        let Phase::Streaming {
            in_flight,
            capture_due,
            ..
        } = &mut self.phase
        else {
            log::debug!("dropping reply received outside of streaming");
            return;
        };

        // The cycle continues whatever the reply says.
        let answered = in_flight.take();
        *capture_due = Some(self.ticks + 1);

        if let Some(frame) = answered {
            self.last_round_trip = Some(now.saturating_duration_since(frame.sent_at));
        }

        match parse_reply(text) {
            Ok(Reply::Detections(reply)) => {
                self.stats.replies += 1;
                let (frame_size, native_size) = match answered {
                    Some(frame) => (frame.frame_size, frame.native_size),
                    None => {
                        let native = source.native_size().unwrap_or_default();
                        (self.encoder.frame_size(native), native)
                    }
                };
                log::debug!(
                    "reply: {} weapon(s) in {:.3}s",
                    reply.total_weapons,
                    reply.processing_time_s
                );
                self.snapshot = Some(
                    DetectionSnapshot::new(
                        reply.boxes,
                        reply.total_weapons,
                        Duration::try_from_secs_f64(reply.processing_time_s).unwrap_or_default(),
                        now,
                        frame_size,
                        native_size,
                    )
                    .with_server_fps(reply.server_fps),
                );
            }
            Ok(Reply::Error(message)) => {
                self.stats.server_errors += 1;
                log::warn!("server rejected frame: {}", message);
                notices.push(Notice::Warning(PipelineError::ServerError(message)));
            }
            Err(err) if err.is_terminal() => self.fail(err, source, notices),
            Err(err) => notices.push(Notice::Warning(err)),
        }
    }

    fn capture_and_send(&mut self, source: &mut FrameSource, notices: &mut Vec<Notice>) {
        let ticks = self.ticks;
        let Phase::Streaming {
            channel,
            in_flight,
            capture_due,
        } = &mut self.phase
        else {
            return;
        };
        if !channel.is_open() || in_flight.is_some() {
            return;
        }
        match capture_due {
            Some(due) if *due <= ticks => {}
            _ => return,
        }

        if source.has_ended() {
            self.finish(Phase::Stopped, Some(source), StopReason::VideoEnded);
            notices.push(Notice::Info("video ended".to_string()));
            return;
        }

        let frame = match self.encoder.capture(source) {
            Ok(Capture::Frame(frame)) => frame,
            Ok(Capture::NotReady) => {
                // Stay armed; the next tick retries.
                self.stats.deferred_captures += 1;
                log::debug!("source not ready, capture deferred");
                return;
            }
            Err(err) => {
                self.stats.deferred_captures += 1;
                log::warn!("frame encode failed, retrying next tick: {:#}", err);
                return;
            }
        };

        let message = encode_frame_message(&frame.to_data_uri());
        if let Err(err) = channel.send_text(message) {
            let err = PipelineError::ChannelError(format!("{:#}", err));
            self.fail(err, source, notices);
            return;
        }
        *in_flight = Some(InFlight {
            sent_at: frame.captured_at,
            frame_size: frame.frame_size,
            native_size: frame.native_size,
        });
        *capture_due = None;
        self.stats.frames_sent += 1;
    }

    fn fail(&mut self, err: PipelineError, source: &mut FrameSource, notices: &mut Vec<Notice>) {
        log::error!("stream terminated: {}", err);
        // Camera tracks stay live so the raw feed keeps rendering.
        let halt = match source.kind() {
            SourceKind::FileVideo => Some(source),
            SourceKind::LiveCamera => None,
        };
        self.finish(Phase::Errored(err.clone()), halt, StopReason::Failed);
        notices.push(Notice::Error(err));
    }

    fn finish(
        &mut self,
        terminal: Phase,
        source: Option<&mut FrameSource>,
        reason: StopReason,
    ) -> bool {
        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        let was_active = match previous {
            Phase::Connecting { mut channel } | Phase::Streaming { mut channel, .. } => {
                channel.close();
                true
            }
            Phase::Idle => {
                self.phase = Phase::Idle;
                false
            }
            other => {
                self.phase = other;
                false
            }
        };
        if !was_active {
            return false;
        }

        if let Some(source) = source {
            source.halt();
        }
        self.snapshot = None;
        self.phase = terminal;
        log::info!(
            "stream stopped ({:?}): sent={} replies={} server_errors={} deferred={}",
            reason,
            self.stats.frames_sent,
            self.stats.replies,
            self.stats.server_errors,
            self.stats.deferred_captures
        );
        true
    }
}
