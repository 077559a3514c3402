//! Core data model (§3): frames, detections, stereo observations and pitch
//! snapshots. All value types are cheap to clone; `ImageBuffer` is
//! reference-counted so cloning a `Frame` never copies pixel data, the same
//! pattern `basic_frame::DynamicFrame` uses for `machine_vision_formats`
//! buffers in the teacher crate.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CameraId {
    Left,
    Right,
}

impl CameraId {
    pub fn other(self) -> CameraId {
        match self {
            CameraId::Left => CameraId::Right,
            CameraId::Right => CameraId::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CameraId::Left => "left",
            CameraId::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
}

/// Shared, read-only-after-capture pixel buffer.
///
/// Cloning an `ImageBuffer` bumps a refcount; it never copies pixels. This is
/// the Rust analogue of the teacher's ref-counted `DynamicFrame` image
/// handles, simplified to raw bytes since pixel-format conversion is out of
/// this crate's scope.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    data: Arc<[u8]>,
}

impl ImageBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: CameraId,
    pub frame_index: u64,
    pub t_capture_ns: i64,
    pub image: ImageBuffer,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl Frame {
    /// `true` when the frame passes the basic validity check from §4.2 step
    /// 4: non-empty image, nonzero dimensions, not all-zero pixel data.
    pub fn is_valid(&self) -> bool {
        self.width != 0
            && self.height != 0
            && !self.image.as_bytes().is_empty()
            && !self.image.is_all_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub camera_id: CameraId,
    pub frame_index: u64,
    pub t_capture_ns: i64,
    pub u: f64,
    pub v: f64,
    pub radius_px: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StereoObservation {
    pub t_ns: i64,
    pub left_uv: (f64, f64),
    pub right_uv: (f64, f64),
    pub x_ft: f64,
    pub y_ft: f64,
    pub z_ft: f64,
    pub quality: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PitchPhase {
    Inactive,
    RampUp,
    Active,
    Ending,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct PitchData {
    pub pitch_index: u32,
    pub phase: PitchPhase,
    pub start_ns: i64,
    pub end_ns: i64,
    pub first_detection_ns: i64,
    pub last_detection_ns: i64,
    pub observations: Vec<StereoObservation>,
    pub pre_roll_frames: Vec<(CameraId, Frame)>,
}

impl PitchData {
    /// Duration per §3: `last_detection_ns - first_detection_ns`, zero if no
    /// detection has landed yet.
    pub fn duration_ns(&self) -> i64 {
        if self.last_detection_ns > 0 {
            self.last_detection_ns - self.first_detection_ns
        } else {
            0
        }
    }

    /// Validity check used during finalization (§4.5): enough observations
    /// and long enough duration.
    pub fn is_valid(&self, min_observations: usize, min_duration_ns: i64) -> Result<(), String> {
        if self.observations.len() < min_observations {
            return Err(format!(
                "too few observations: {} < {min_observations}",
                self.observations.len()
            ));
        }
        let duration = self.duration_ns();
        if duration < min_duration_ns {
            return Err(format!(
                "too short: {duration}ns < {min_duration_ns}ns"
            ));
        }
        if self.start_ns <= 0 {
            return Err("invalid start timestamp".to_string());
        }
        Ok(())
    }
}
