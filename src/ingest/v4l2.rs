//! V4L2 capture backend for `CameraSource`.
//!
//! The device is opened and dequeued on a dedicated capture thread. Frames are
//! normalized to RGB there and handed over through a small bounded queue, so
//! `next_frame` never waits on the driver: it returns the newest frame that
//! arrived since the last call, or nothing. Dropping the backend stops the
//! thread, which stops the stream and closes the device node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use super::camera::CameraConfig;
use super::normalize::{normalize_to_rgb, PixelFormat};
use crate::error::SourceFault;
use crate::geometry::Size;

/// How long `open` waits for the capture thread to negotiate the device.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames buffered between the capture thread and the scheduler.
const FRAME_QUEUE: usize = 2;

type FrameResult = std::result::Result<RgbImage, String>;

pub(crate) struct DeviceCamera {
    device_path: String,
    size: Size,
    frames: Option<Receiver<FrameResult>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceCamera {
    pub(crate) fn open(config: &CameraConfig) -> Result<Self, SourceFault> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<Size, SourceFault>>(1);
        let (frame_tx, frame_rx) = mpsc::sync_channel::<FrameResult>(FRAME_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let config = config.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("v4l2-capture".to_string())
                .spawn(move || match CaptureDevice::open(&config) {
                    Ok(device) => {
                        if ready_tx.send(Ok(device.size())).is_ok() {
                            capture_loop(device, &frame_tx, &stop);
                        }
                    }
                    Err(fault) => {
                        let _ = ready_tx.send(Err(fault));
                    }
                })
                .map_err(|err| {
                    SourceFault::DeviceUnavailable(format!("spawn capture thread: {}", err))
                })?
        };

        let size = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(size)) => size,
            Ok(Err(fault)) => {
                let _ = worker.join();
                return Err(fault);
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread exits on its own once it sees the stop flag.
                stop.store(true, Ordering::SeqCst);
                return Err(SourceFault::DeviceUnavailable(format!(
                    "{}: no response within {:?}",
                    config.device, OPEN_TIMEOUT
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Err(SourceFault::DeviceUnavailable(format!(
                    "{}: capture thread exited during open",
                    config.device
                )));
            }
        };

        Ok(Self {
            device_path: config.device.clone(),
            size,
            frames: Some(frame_rx),
            stop,
            worker: Some(worker),
        })
    }

    pub(crate) fn size(&self) -> Size {
        self.size
    }

    /// Newest frame captured since the last call. `Ok(None)` when the device
    /// has not delivered anything new yet.
    pub(crate) fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| anyhow!("{} is closed", self.device_path))?;
        let mut latest = None;
        loop {
            match frames.try_recv() {
                Ok(Ok(frame)) => latest = Some(frame),
                Ok(Err(reason)) => {
                    return Err(anyhow!("capture v4l2 frame from {}: {}", self.device_path, reason))
                }
                Err(TryRecvError::Empty) => return Ok(latest),
                Err(TryRecvError::Disconnected) => {
                    return match latest {
                        Some(frame) => Ok(Some(frame)),
                        None => Err(anyhow!("capture thread for {} stopped", self.device_path)),
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblocks a worker waiting to hand over a frame.
        self.frames = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("CameraSource: capture thread for {} panicked", self.device_path);
            }
        }
    }
}

impl Drop for DeviceCamera {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(mut device: CaptureDevice, frames: &SyncSender<FrameResult>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match device.next_frame() {
            Ok(frame) => match frames.try_send(Ok(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::trace!("v4l2: scheduler behind, frame dropped"),
                Err(TrySendError::Disconnected(_)) => break,
            },
            Err(err) => {
                let _ = frames.send(Err(format!("{:#}", err)));
                break;
            }
        }
    }
    log::debug!("v4l2: capture thread for {} exiting", device.device_path);
}

struct CaptureDevice {
    device_path: String,
    state: DeviceState,
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl CaptureDevice {
    fn open(config: &CameraConfig) -> Result<Self, SourceFault> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device).map_err(|err| {
            if err.kind() == std::io::ErrorKind::PermissionDenied {
                SourceFault::PermissionDenied(format!("{}: {}", config.device, err))
            } else {
                SourceFault::DeviceUnavailable(format!("{}: {}", config.device, err))
            }
        })?;

        let unavailable =
            |err: std::io::Error| SourceFault::DeviceUnavailable(format!("{}: {}", config.device, err));

        let mut format = device.format().map_err(unavailable)?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "CameraSource: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device.format().map_err(unavailable)?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            SourceFault::UnsupportedFormat(format!(
                "{} delivers {}, expected YUYV/MJPG/RGB3",
                config.device, format.fourcc
            ))
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "CameraSource: failed to set fps on {}: {}",
                    config.device,
                    err
                );
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| SourceFault::DeviceUnavailable(format!("{:#}", err)))?;

        Ok(Self {
            device_path: config.device.clone(),
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
        })
    }

    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Blocks until the driver hands over the next buffer.
    fn next_frame(&mut self) -> Result<RgbImage> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let pixels = self
            .state
            .with_stream_mut(|stream| -> Result<Vec<u8>> {
                let (buf, _meta) = stream.next().context("dequeue v4l2 buffer")?;
                normalize_to_rgb(buf, width, height, format)
            })
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))?;
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("v4l2 frame does not match {}x{}", width, height))
    }
}
