//! rollcall-hw: Frame acquisition for the attendance monitor.
//!
//! Local V4L2 devices and HTTP snapshot cameras behind one [`FrameSource`]
//! trait, plus the frame normalisation the monitor applies before detection.

pub mod camera;
pub mod frame;
pub mod snapshot;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use snapshot::SnapshotCamera;
pub use source::{FrameSource, SourceError, SourceSpec};
