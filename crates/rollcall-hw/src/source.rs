//! The [`FrameSource`] seam and camera source strings.

use crate::frame::Frame;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("unsupported source: {0}")]
    Unsupported(String),
    #[error("snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not decode snapshot: {0}")]
    Decode(#[from] image::ImageError),
    #[error("read timed out")]
    Timeout,
    #[error("previous read still in flight")]
    InFlight,
}

/// Yields frames from one camera endpoint.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Frame, SourceError>;
}

/// Where a camera's frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// V4L2 device path.
    Device(String),
    /// HTTP(S) endpoint returning one encoded image per request.
    Snapshot(String),
    /// Recognised but not readable in-process (e.g. `rtsp://`).
    Unsupported(String),
}

impl FromStr for SourceSpec {
    type Err = std::convert::Infallible;

    /// `"0"` → `/dev/video0`; `/dev/...` paths and `http(s)://` URLs as given.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            SourceSpec::Device(format!("/dev/video{s}"))
        } else if s.starts_with("/dev/") {
            SourceSpec::Device(s.to_string())
        } else if s.starts_with("http://") || s.starts_with("https://") {
            SourceSpec::Snapshot(s.to_string())
        } else {
            SourceSpec::Unsupported(s.to_string())
        })
    }
}

impl SourceSpec {
    /// Open the source. `read_timeout` bounds each device dequeue or network read.
    pub fn open(&self, read_timeout: Duration) -> Result<Box<dyn FrameSource>, SourceError> {
        match self {
            SourceSpec::Device(path) => Ok(Box::new(crate::camera::Camera::open(path, read_timeout)?)),
            SourceSpec::Snapshot(url) => Ok(Box::new(crate::snapshot::SnapshotCamera::new(url, read_timeout)?)),
            SourceSpec::Unsupported(s) => Err(SourceError::Unsupported(format!(
                "{s} (use a device index, /dev/videoN, or an http(s) snapshot URL)"
            ))),
        }
    }
}
