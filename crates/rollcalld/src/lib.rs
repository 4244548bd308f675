//! rollcalld: camera attendance daemon.
//!
//! A monitor loop reads every configured camera, recognises enrolled faces
//! and records attendance through the ledger; an HTTP API accepts
//! enrollments and serves the operator view.

pub mod config;
pub mod engine;
pub mod enroll;
pub mod http;
pub mod monitor;
pub mod mosaic;
pub mod scheduler;

pub use config::{CameraConfig, Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use http::{build_router, AppState};
pub use monitor::{device_opener, Monitor, MonitorSettings, SourceOpener};
