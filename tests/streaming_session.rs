use std::time::{Duration, Instant};

use url::Url;
use weapon_watch::overlay::{IN_ZONE_COLOR, OUT_OF_ZONE_COLOR, ROI_LABEL};
use weapon_watch::{
    CameraConfig, ChannelEvent, DrawOp, FileVideoConfig, MemoryLink, Notice, PipelineError, Rect,
    Session, SessionSettings, Size, SourceSpec, StreamState, TeardownReport,
};

const EMPTY_REPLY: &str = r#"{"detections": [], "total_weapons": 0, "processing_time": 0.01}"#;

const KNIFE_REPLY: &str = r#"{
    "detections": [
        {"class_name": "knife", "confidence": 0.82, "bbox": {"x1": 10, "y1": 10, "x2": 50, "y2": 80}}
    ],
    "total_weapons": 1,
    "processing_time": 0.05
}"#;

fn session(link: &MemoryLink) -> Session {
    let mut settings = SessionSettings::new(Url::parse("ws://127.0.0.1:8000/ws").unwrap());
    settings.display = Size::new(640, 480);
    settings.token = Some("secret".to_string());
    Session::new(settings, Box::new(link.connector()))
}

fn camera() -> SourceSpec {
    camera_at("stub://lobby")
}

fn camera_at(device: &str) -> SourceSpec {
    SourceSpec::Camera(CameraConfig {
        device: device.to_string(),
        width: 640,
        height: 480,
        target_fps: 30,
    })
}

fn clip(frames: u32) -> SourceSpec {
    SourceSpec::File(FileVideoConfig {
        path: format!("stub://clip?frames={}&width=320&height=240", frames),
        fps: 0,
    })
}

/// Ticks until the first frame has been sent.
fn stream_first_frame(session: &mut Session, link: &MemoryLink, now: Instant) {
    for _ in 0..4 {
        session.tick(now);
        if link.sent_count() == 1 {
            return;
        }
    }
    panic!("no frame sent after 4 ticks");
}

#[test]
fn scenario_a_knife_without_roi() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    assert_eq!(session.stream_state(), StreamState::Streaming);

    link.push_reply(KNIFE_REPLY);
    let plan = session.tick(now).expect("render active");
    assert_eq!(plan.labels(), vec!["knife 82%"]);
    assert_eq!(plan.box_colors(), vec![OUT_OF_ZONE_COLOR]);

    let params = &link.connects()[0];
    assert!(params.roi.is_none());
    assert_eq!(params.token.as_deref(), Some("secret"));
}

#[test]
fn scenario_b_zone_membership_by_center() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session
        .set_roi_display(Rect::new(0.0, 0.0, 100.0, 100.0))
        .unwrap();
    session.start_streaming().unwrap();
    assert_eq!(
        link.connects()[0].url().query_pairs().find(|(k, _)| k == "roi").map(|(_, v)| v.into_owned()),
        Some("0,0,100,100".to_string())
    );

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply(
        r#"{
            "detections": [
                {"class_name": "knife", "confidence": 0.9, "bbox": {"x1": 30, "y1": 30, "x2": 70, "y2": 70}},
                {"class_name": "pistol", "confidence": 0.75, "bbox": {"x1": 480, "y1": 480, "x2": 520, "y2": 520}}
            ],
            "total_weapons": 2,
            "processing_time": 0.04
        }"#,
    );
    let plan = session.tick(now).expect("render active");
    assert_eq!(
        plan.labels(),
        vec![ROI_LABEL, "knife 90% [IN ZONE]", "pistol 75%"]
    );
    assert_eq!(plan.box_colors(), vec![IN_ZONE_COLOR, OUT_OF_ZONE_COLOR]);
}

#[test]
fn scenario_c_video_end_stops_once() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&clip(3)).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply(EMPTY_REPLY);

    let mut notices = Vec::new();
    for _ in 0..10 {
        session.tick(now);
        notices.extend(session.drain_notices());
    }

    assert_eq!(session.stream_state(), StreamState::Stopped);
    assert!(!link.is_open());
    assert_eq!(link.close_count(), 1);
    assert_eq!(link.sent_count(), 1);
    let ended = notices
        .iter()
        .filter(|notice| **notice == Notice::Info("video ended".to_string()))
        .count();
    assert_eq!(ended, 1);
    // last frame stays on screen
    assert!(session.is_rendering());
}

#[test]
fn scenario_d_double_teardown_is_quiet() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();
    session.tick(Instant::now());
    assert!(session.stop_streaming());

    let first = session.teardown();
    assert!(first.released_source);
    assert!(!first.stopped_stream);
    assert!(session.teardown().is_noop());
    assert_eq!(link.close_count(), 1);
    assert!(session.drain_notices().is_empty());
}

#[test]
fn at_most_one_frame_in_flight() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    let mut answered = 0usize;
    for i in 0..60 {
        session.tick(now);
        let sent = link.sent_count();
        assert!(sent <= answered + 1, "tick {}: {} sent, {} answered", i, sent, answered);
        if sent == answered + 1 && i % 3 == 0 {
            // every fourth answer is a server-side error; the cycle continues
            if answered % 4 == 3 {
                link.push_reply(r#"{"error": "Invalid frame data"}"#);
            } else {
                link.push_reply(EMPTY_REPLY);
            }
            answered += 1;
        }
    }
    assert!(answered >= 10);
    assert_eq!(session.stream_state(), StreamState::Streaming);
    assert!(session.flow_stats().server_errors >= 2);
}

#[test]
fn malformed_reply_errors_but_keeps_rendering_file() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&clip(100)).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply("{not json");
    let plan = session.tick(now);

    assert!(matches!(
        session.stream_state(),
        StreamState::Errored(PipelineError::ParseError(_))
    ));
    assert!(plan.is_some());
    assert!(session.snapshot().is_none());
    assert!(matches!(
        session.drain_notices().as_slice(),
        [Notice::Error(PipelineError::ParseError(_))]
    ));

    // a fresh start is allowed after an error
    session.start_streaming().unwrap();
    assert_eq!(link.connects().len(), 2);
}

#[test]
fn server_close_terminates_stream() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_event(ChannelEvent::Closed(Some("going away".to_string())));
    session.tick(now);
    assert!(matches!(
        session.stream_state(),
        StreamState::Errored(PipelineError::ChannelError(_))
    ));
    assert!(!session.is_streaming());
}

#[test]
fn stale_detections_disappear() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let start = Instant::now();
    stream_first_frame(&mut session, &link, start);
    link.push_reply(KNIFE_REPLY);
    session.tick(start);

    assert_eq!(
        session.plan(start + Duration::from_millis(100)).labels(),
        vec!["knife 82%"]
    );
    assert!(session
        .plan(start + Duration::from_millis(600))
        .labels()
        .is_empty());
}

#[test]
fn refused_connection_surfaces_channel_error() {
    let link = MemoryLink::new();
    link.refuse_next_connect("server offline");
    let mut session = session(&link);
    session.switch_mode(&clip(10)).unwrap();

    let err = session.start_streaming().unwrap_err();
    assert!(matches!(err, PipelineError::ChannelError(_)));
    assert!(matches!(
        session.stream_state(),
        StreamState::Errored(PipelineError::ChannelError(_))
    ));
    assert_eq!(session.drain_notices(), vec![Notice::Error(err)]);
}

#[test]
fn camera_feed_keeps_rendering_after_stream_error() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply(KNIFE_REPLY);
    session.tick(now);
    link.push_event(ChannelEvent::Error("connection reset".to_string()));
    session.tick(now);
    assert!(matches!(
        session.stream_state(),
        StreamState::Errored(PipelineError::ChannelError(_))
    ));

    let plan = session.tick(now).expect("render active");
    assert!(matches!(plan.ops.first(), Some(DrawOp::Frame { .. })));
    assert!(plan.labels().is_empty());
    assert!(session.source().unwrap().is_open());

    // the camera can be streamed again without reopening
    session.start_streaming().unwrap();
    assert_eq!(link.connects().len(), 2);
}

#[test]
fn refused_connection_keeps_camera_feed() {
    let link = MemoryLink::new();
    link.refuse_next_connect("server offline");
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    assert!(session.start_streaming().is_err());

    let now = Instant::now();
    session.tick(now);
    let plan = session.tick(now).expect("render active");
    assert!(matches!(plan.ops.first(), Some(DrawOp::Frame { .. })));
}

#[test]
fn stalled_camera_never_blocks_the_tick() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera_at("stub://stalled")).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    for _ in 0..20 {
        let plan = session.tick(now).expect("render active");
        assert!(plan.ops.is_empty());
    }
    assert_eq!(session.stream_state(), StreamState::Streaming);
    assert_eq!(link.sent_count(), 0);
    assert!(session.flow_stats().deferred_captures >= 19);
}

#[test]
fn server_error_with_partial_detections_keeps_streaming() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply(
        r#"{"error": "Detection failed", "detections": [{"class_name": "gun"}], "total_weapons": 0}"#,
    );
    session.tick(now);
    assert_eq!(session.stream_state(), StreamState::Streaming);
    assert_eq!(
        session.drain_notices(),
        vec![Notice::Warning(PipelineError::ServerError(
            "Detection failed".to_string()
        ))]
    );
    session.tick(now);
    assert_eq!(link.sent_count(), 2);
}

#[test]
fn teardown_of_a_fresh_session_is_a_no_op() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    assert!(session.teardown().is_noop());
    assert!(session.teardown().is_noop());
    assert!(session.drain_notices().is_empty());
    assert_eq!(link.close_count(), 0);
}

#[test]
fn teardown_after_stream_error_releases_source_once() {
    let link = MemoryLink::new();
    let mut session = session(&link);
    session.switch_mode(&camera()).unwrap();
    session.start_streaming().unwrap();

    let now = Instant::now();
    stream_first_frame(&mut session, &link, now);
    link.push_reply("{not json");
    session.tick(now);
    assert!(matches!(session.stream_state(), StreamState::Errored(_)));
    assert_eq!(link.close_count(), 1);

    assert_eq!(
        session.teardown(),
        TeardownReport {
            stopped_stream: false,
            halted_render: true,
            released_source: true,
        }
    );
    assert!(session.teardown().is_noop());
    assert!(session.tick(now).is_none());
    assert_eq!(link.close_count(), 1);
}
