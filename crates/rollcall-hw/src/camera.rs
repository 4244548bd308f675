//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use image::GrayImage;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
/// Frames read after STREAMON while waiting for a non-dark one.
const WARMUP_FRAMES: usize = 5;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

/// V4L2 camera device handle. Released when dropped.
///
/// The capture stream is started on the first read and kept running, so
/// successive reads dequeue live buffers instead of restarting the device.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    read_timeout: Duration,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0"). A dequeue
    /// that waits longer than `read_timeout` fails.
    pub fn open(device_path: &str, read_timeout: Duration) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                SourceError::DeviceBusy
            } else {
                SourceError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(SourceError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            read_timeout,
        })
    }

    /// Capture a single frame, converting to grayscale if needed.
    ///
    /// The first read after the stream starts skips up to [`WARMUP_FRAMES`]
    /// dark frames.
    pub fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let warmup = if self.stream.is_none() {
            self.start_stream()?;
            WARMUP_FRAMES
        } else {
            1
        };

        let mut frame = self.next_frame()?;
        for _ in 1..warmup {
            if !frame::is_dark_frame(frame.image.as_raw(), 0.95) {
                break;
            }
            tracing::debug!(device = %self.device_path, seq = frame.sequence, "skipping dark warm-up frame");
            frame = self.next_frame()?;
        }
        Ok(frame)
    }

    fn start_stream(&mut self) -> Result<(), SourceError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| SourceError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(self.read_timeout.min(Duration::from_secs(3600)));
        self.stream = Some(stream);
        Ok(())
    }

    /// Dequeue one buffer. A failed dequeue stops the stream; the next read
    /// starts it again.
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::CaptureFailed("capture stream not started".into()))?;

        let dequeued = stream
            .next()
            .map(|(buf, meta)| (buf_to_grayscale(format, width, height, buf), meta.sequence));
        let (gray, sequence) = match dequeued {
            Ok(dequeued) => dequeued,
            Err(e) => {
                self.stream = None;
                return Err(SourceError::CaptureFailed(format!("failed to dequeue buffer: {e}")));
            }
        };

        let image = GrayImage::from_raw(width, height, gray?)
            .ok_or_else(|| SourceError::CaptureFailed("frame buffer smaller than negotiated size".into()))?;
        Ok(Frame::new(image, sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Frame, SourceError> {
        self.capture_frame()
    }
}

fn buf_to_grayscale(format: PixelFormat, width: u32, height: u32, buf: &[u8]) -> Result<Vec<u8>, SourceError> {
    let pixels = (width * height) as usize;
    match format {
        PixelFormat::Grey => buf
            .get(..pixels)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SourceError::CaptureFailed(format!("GREY buffer too short: expected {pixels}, got {}", buf.len()))),
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| SourceError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}
