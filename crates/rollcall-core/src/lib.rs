//! rollcall-core: Attendance admission and face recognition building blocks.
//!
//! The ledger decides which sightings become attendance events; the recorder
//! couples those decisions with persistence. Faces are found with SCRFD (ONNX)
//! and identified with an LBPH nearest-neighbour matcher.

pub mod detector;
pub mod ledger;
pub mod recognizer;
pub mod recorder;
pub mod store;
pub mod types;
pub mod view;

pub use detector::{FaceDetector, ScrfdDetector};
pub use ledger::{AdmissionDecision, AttendanceLedger, LedgerEntry};
pub use recognizer::LbphRecognizer;
pub use recorder::{lock_ledger, AttendanceRecorder, EventOutcome, RecordReport};
pub use store::{AttendanceStore, StoreError};
pub use types::{BoundingBox, FaceMatcher, Identity, MatchOutcome, Observation};
pub use view::{Gesture, GridLayout, ViewController, ViewState};

use std::path::{Path, PathBuf};

/// `$XDG_DATA_HOME`, falling back to `$HOME/.local/share`. Variables are
/// read through `var` so callers can supply their own environment.
pub fn data_home(var: impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|| {
        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
        PathBuf::from(home).join(".local/share")
    })
}

/// Model directory under a data home.
pub fn model_dir_in(data_home: &Path) -> PathBuf {
    data_home.join("rollcall/models")
}

/// Default directory for ONNX model files, from the process environment.
pub fn default_model_dir() -> PathBuf {
    model_dir_in(&data_home(|key| std::env::var(key).ok()))
}
