//! weapon_watch - live annotation client for a remote weapon-detection service
//!
//! This binary:
//! 1. Opens a live camera or a local video file
//! 2. Optionally sets a danger zone (ROI) in display units
//! 3. Streams frames to the realtime detection endpoint, one in flight at a time
//! 4. Renders detection overlays every tick and optionally dumps them as PNG
//! 5. Tears the session down on Ctrl-C, end of video, or the duration limit

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weapon_watch::{
    ClientConfig, FileVideoConfig, Notice, Rect, Session, SourceSpec, StreamState, WsConnector,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a camera or video file to a weapon-detection service")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Danger zone in display units, as x,y,width,height.
    #[arg(long, value_parser = parse_roi, value_name = "X,Y,W,H")]
    roi: Option<Rect>,

    /// Directory to write rendered overlay frames to (PNG).
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    /// Write every Nth rendered frame when --dump-dir is set.
    #[arg(long, default_value_t = 15)]
    dump_every: u64,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Scheduler tick in milliseconds.
    #[arg(long, default_value_t = 33)]
    tick_ms: u64,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Stream a live camera.
    Camera {
        /// Capture device (overrides config and WEAPON_WATCH_CAMERA).
        #[arg(long)]
        device: Option<String>,
    },
    /// Stream a local video file.
    File {
        path: String,
        /// Playback rate override in frames per second.
        #[arg(long)]
        fps: Option<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(&args.ui, std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load configuration");
        ClientConfig::load()?
    };
    let spec = match &args.mode {
        Mode::Camera { device } => {
            let mut camera = cfg.camera.clone();
            if let Some(device) = device {
                camera.device = device.clone();
            }
            SourceSpec::Camera(camera)
        }
        Mode::File { path, fps } => {
            let FileVideoConfig { path, fps: default_fps } = cfg.file_source(path.as_str());
            SourceSpec::File(FileVideoConfig {
                path,
                fps: fps.unwrap_or(default_fps),
            })
        }
    };
    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dump dir {}", dir.display()))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let settings = cfg.session_settings()?;
    if let Some(font) = &settings.font {
        log::debug!("label font: {}", font.origin().display());
    }
    let mut session = Session::new(settings, Box::new(WsConnector::default()));
    {
        let _stage = ui.stage(&format!("Open {} source", spec.kind()));
        session.switch_mode(&spec)?;
    }
    if let Some(roi) = args.roi {
        let native = session.set_roi_display(roi)?;
        log::info!(
            "danger zone (native): {:.0},{:.0} {:.0}x{:.0}",
            native.x,
            native.y,
            native.width,
            native.height
        );
    }
    {
        let _stage = ui.stage(&format!("Connect to {}", cfg.endpoint));
        session.start_streaming()?;
    }

    let outcome = run(&mut session, &args, &running, ui.live());
    let report = session.teardown();
    log::info!(
        "teardown: stream={} render={} source={}",
        report.stopped_stream,
        report.halted_render,
        report.released_source
    );
    outcome
}

fn run(
    session: &mut Session,
    args: &Args,
    running: &AtomicBool,
    mut status: ui::LiveStatus,
) -> Result<()> {
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut rendered = 0u64;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if deadline.map_or(false, |deadline| now >= deadline) {
            log::info!("duration limit reached");
            break;
        }

        let plan = session.tick(now);
        for notice in session.drain_notices() {
            match &notice {
                Notice::Info(_) => log::info!("{}", notice),
                Notice::Warning(_) => log::warn!("{}", notice),
                Notice::Error(_) => log::error!("{}", notice),
            }
            status.println(&notice.to_string());
        }

        if let Some(plan) = plan {
            rendered += 1;
            if let Some(dir) = &args.dump_dir {
                if rendered % args.dump_every.max(1) == 0 {
                    let path = dir.join(format!("overlay_{:06}.png", rendered));
                    session
                        .paint(&plan)
                        .save(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
            }
        }

        let stats = session.flow_stats();
        let mut line = format!(
            "sent={} replies={} server_errors={}",
            stats.frames_sent, stats.replies, stats.server_errors
        );
        if let Some(snapshot) = session.snapshot() {
            line.push_str(&format!(
                " weapons={} inference={}ms",
                snapshot.total(),
                snapshot.processing_time().as_millis()
            ));
            if let Some(fps) = snapshot.server_fps() {
                line.push_str(&format!(" server_fps={:.1}", fps));
            }
        }
        if let Some(rtt) = session.last_round_trip() {
            line.push_str(&format!(" rtt={}ms", rtt.as_millis()));
        }
        status.update(line);

        match session.stream_state() {
            StreamState::Stopped => {
                status.finish("stream stopped");
                return Ok(());
            }
            StreamState::Errored(err) => {
                status.finish("stream failed");
                return Err(anyhow!(err));
            }
            _ => {}
        }

        let spent = now.elapsed();
        if spent < tick {
            std::thread::sleep(tick - spent);
        }
    }
    status.finish("interrupted");
    Ok(())
}

fn parse_roi(value: &str) -> Result<Rect, String> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid roi '{}': expected four numbers", value))?;
    match parts.as_slice() {
        [x, y, width, height] if *width >= 0.0 && *height >= 0.0 => {
            Ok(Rect::new(*x, *y, *width, *height))
        }
        _ => Err(format!("invalid roi '{}': expected x,y,width,height", value)),
    }
}
