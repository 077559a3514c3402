//! Crate-wide error types.
//!
//! Mirrors the `ci2::Error` / `flydra2::Error` shape of the teacher crates: a
//! flat `thiserror` enum per semantic error class (§7 of the spec), not one
//! variant per call site.

/// Coarse classification of an error, carried on `Event::Error` so
/// subscribers can decide how to react without matching on the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    TransientIo,
    Resource,
    Protocol,
    Detector,
    Callback,
    SyncDrift,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera {camera_id:?} failed to open: {message}")]
    CameraOpen {
        camera_id: crate::types::CameraId,
        message: String,
    },

    #[error("camera {camera_id:?} read failed: {message}")]
    CameraRead {
        camera_id: crate::types::CameraId,
        message: String,
    },

    #[error("detector failed: {message}")]
    Detector { message: String },

    #[error("analyzer failed: {message}")]
    Analyzer { message: String },

    #[error("protocol violation: {message}")]
    Protocol { message: String },

    #[error("internal invariant violated: {message}")]
    Fatal { message: String },

    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::CameraOpen { .. } => ErrorCategory::Resource,
            Error::CameraRead { .. } => ErrorCategory::TransientIo,
            Error::Detector { .. } => ErrorCategory::Detector,
            Error::Analyzer { .. } => ErrorCategory::Callback,
            Error::Protocol { .. } => ErrorCategory::Protocol,
            Error::Fatal { .. } => ErrorCategory::Fatal,
            Error::Serde(_) => ErrorCategory::Protocol,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Fatal => ErrorSeverity::Critical,
            ErrorCategory::Resource | ErrorCategory::Detector | ErrorCategory::Callback => {
                ErrorSeverity::Error
            }
            ErrorCategory::TransientIo | ErrorCategory::SyncDrift => ErrorSeverity::Warning,
            ErrorCategory::Protocol => ErrorSeverity::Error,
        }
    }
}
