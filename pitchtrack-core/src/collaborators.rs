//! External collaborator interfaces (§6) and the summary types built on top
//! of them (§4.6, §4.7).
//!
//! Camera hardware, the ball detector, trajectory/strike-zone analysis and
//! disk recording are all out of this crate's scope per §1's Non-goals; this
//! module declares the traits an embedder implements, grounded in the
//! teacher's `ci2::Camera` / `ci2_async::AsyncCamera` trait shape (open,
//! configure, read with timeout, stats, close) and `flydra2`'s narrow
//! collaborator traits for things it consumes but does not implement itself.

use crate::error::Result;
use crate::types::{CameraId, Detection, Frame, PitchData, PitchPhase};

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub flip_180: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraControls {
    pub exposure_us: Option<u32>,
    pub gain: Option<f64>,
    pub white_balance_auto: bool,
    pub white_balance_kelvin: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraStats {
    pub frames_read: u64,
    pub timeouts: u64,
    pub errors: u64,
}

/// Distinguishes "no frame arrived in time" (not an error, §4.2 step 2) from
/// an actual read failure.
pub enum ReadOutcome {
    Timeout,
    Frame(Frame),
}

/// A physical (or simulated) camera device. Implemented by embedders; the
/// `sim` backend in the `pitchtrack` CLI is the only implementation carried
/// in this crate.
pub trait CameraDevice: Send {
    fn open(&mut self, id: CameraId) -> Result<()>;
    fn set_mode(&mut self, mode: CameraMode) -> Result<()>;
    fn set_controls(&mut self, controls: CameraControls) -> Result<()>;
    fn read_frame(&mut self, timeout_ms: u32) -> Result<ReadOutcome>;
    fn get_stats(&self) -> CameraStats;
    fn close(&mut self);
}

/// Ball detector: a pure function from the core's point of view, possibly
/// expensive (§6 "tens of ms").
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// One analyzer's verdict on a finalized pitch (§4.7). Trajectory/strike-zone
/// math is an external concern; only the resulting summary crosses into this
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PitchSummary {
    pub pitch_index: u32,
    pub is_strike: bool,
    pub zone_row: u8,
    pub zone_col: u8,
    pub speed_mph: f64,
}

/// Analyzer collaborator (§6, §4.7): `analyze_pitch`.
pub trait Analyzer: Send {
    fn analyze_pitch(&mut self, pitch: &PitchData) -> Result<PitchSummary>;
}

/// Aggregate session statistics (§4.7): counts, strike/ball tally, and a 3x3
/// zone heatmap over accepted `PitchSummary`s.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionSummary {
    pub total_pitches: u32,
    pub strikes: u32,
    pub balls: u32,
    pub zone_heatmap: [[u32; 3]; 3],
}

impl SessionSummary {
    pub fn record(&mut self, summary: &PitchSummary) {
        self.total_pitches += 1;
        if summary.is_strike {
            self.strikes += 1;
        } else {
            self.balls += 1;
        }
        let row = (summary.zone_row as usize).min(2);
        let col = (summary.zone_col as usize).min(2);
        self.zone_heatmap[row][col] += 1;
    }
}

/// Narrow disk-recording collaborator (§4.6, §4.7). Disk format is out of
/// scope per the Non-goals; this trait carries exactly the data the
/// orchestrator and analysis dispatcher need to drive lifecycle enforcement
/// and path lookups without this crate writing a single byte to disk.
pub trait RecordingSink: Send {
    /// Begin a new recording session. Returns a low-disk-space warning
    /// string, if any, rather than failing outright (§7 "Resource").
    fn start_session(&mut self, session_name: &str) -> Result<Option<String>>;

    /// End the current session, returning an opaque path/bundle identifier.
    fn stop_session(&mut self) -> Result<String>;

    /// Called once per finalized pitch so the sink can lay out its
    /// per-pitch subdirectory (§6 "Persisted state layout").
    fn record_pitch(&mut self, pitch: &PitchData, phase: PitchPhase) -> Result<String>;

    /// Paths of the last `n` finalized pitches, most recent first. An empty
    /// vec (not an error) when no sink is configured or none are recorded
    /// yet (§4.7).
    fn recent_pitch_paths(&self, n: usize) -> Vec<String>;
}
