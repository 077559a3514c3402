//! Event payloads published through the [`crate::event_bus::EventBus`] (§3,
//! §4.1). Each is a plain, cheap-to-clone value type — the Rust analogue of
//! the Python `@dataclass(frozen=True)` event records in `event_types.py`.

use crate::error::{ErrorCategory, ErrorSeverity};
use crate::types::{CameraId, Frame, PitchPhase, StereoObservation};

#[derive(Debug, Clone)]
pub struct FrameCaptured {
    pub camera_id: CameraId,
    pub frame: Frame,
    pub t_ns: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ObservationDetected {
    pub observation: StereoObservation,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct PitchStart {
    pub pitch_index: u32,
    pub t_ns: i64,
    pub pre_roll_frames: Vec<(CameraId, Frame)>,
}

#[derive(Debug, Clone)]
pub struct PitchEnd {
    pub pitch_index: u32,
    pub phase: PitchPhase,
    pub observations: Vec<StereoObservation>,
    pub t_ns: i64,
    pub duration_ns: i64,
}

/// Named `ErrorEvent` (not `Error`) to avoid colliding with
/// [`crate::error::Error`], the Result error type.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub source: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub details: Option<String>,
}

impl ErrorEvent {
    pub fn new(source: impl Into<String>, err: &crate::error::Error) -> Self {
        Self {
            source: source.into(),
            category: err.category(),
            severity: err.severity(),
            message: err.to_string(),
            details: None,
        }
    }
}
