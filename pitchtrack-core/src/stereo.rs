//! Stereo pairing & triangulation (C5, §4.4).
//!
//! The temporal pairing state (two bounded ring buffers of
//! `(Frame, Vec<Detection>)`, dropping the older head on tolerance overrun)
//! and the pure epipolar/triangulation math are grounded in
//! `stereo/simple_stereo.py` and `stereo/association.py`; the ring-buffer
//! pairing discipline itself mirrors `flydra2::frame_bundler`'s
//! time-ordered, lossy bundling of per-camera streams, adapted from an async
//! `Stream` combinator to a plain pull-based struct per this crate's
//! native-thread concurrency model (§5).

use crate::roi::RoiGate;
use crate::ring_buffer::RingBuffer;
use crate::types::{CameraId, Detection, Frame, StereoObservation};

/// Stereo rig geometry, carried over from the Python `StereoGeometry`
/// dataclass (`stereo/simple_stereo.py`) verbatim (§2.2).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StereoGeometry {
    pub baseline_ft: f64,
    pub focal_length_px: f64,
    pub cx: f64,
    pub cy: f64,
    pub epipolar_epsilon_px: f64,
    pub z_min_ft: f64,
    pub z_max_ft: f64,
}

/// Minimum allowed magnitude of disparity before triangulation, guarding
/// against division blowing up near zero (§4.4 step 6).
const MIN_DISPARITY_PX: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct StereoMatch {
    pub left: Detection,
    pub right: Detection,
    pub epipolar_error_px: f64,
    pub score: f64,
}

/// §4.4 step 3: for each left detection scan right detections sorted by `v`,
/// admitting pairs within `epsilon_px`, breaking early once the sorted right
/// set has moved past `l.v + epsilon_px`.
pub fn epipolar_candidates(
    lefts: &[Detection],
    rights: &[Detection],
    epsilon_px: f64,
) -> Vec<StereoMatch> {
    let mut sorted_rights = rights.to_vec();
    sorted_rights.sort_by(|a, b| a.v.partial_cmp(&b.v).unwrap_or(std::cmp::Ordering::Equal));

    let mut matches = Vec::new();
    for &l in lefts {
        for &r in &sorted_rights {
            if r.v > l.v + epsilon_px {
                break;
            }
            let err = (l.v - r.v).abs();
            if err <= epsilon_px {
                matches.push(StereoMatch {
                    left: l,
                    right: r,
                    epipolar_error_px: err,
                    score: l.confidence.min(r.confidence),
                });
            }
        }
    }
    matches
}

/// §4.4 step 6: pinhole triangulation from a matched detection pair.
pub fn triangulate(m: &StereoMatch, geom: &StereoGeometry) -> StereoObservation {
    let raw_disparity = m.left.u - m.right.u;
    let disparity = if raw_disparity.abs() < MIN_DISPARITY_PX {
        if raw_disparity >= 0.0 {
            MIN_DISPARITY_PX
        } else {
            -MIN_DISPARITY_PX
        }
    } else {
        raw_disparity
    };

    let z_ft = (geom.focal_length_px * geom.baseline_ft) / disparity;
    let x_ft = (m.left.u - geom.cx) * z_ft / geom.focal_length_px;
    let y_ft = (m.left.v - geom.cy) * z_ft / geom.focal_length_px;

    let in_range = geom.z_min_ft <= z_ft && z_ft <= geom.z_max_ft;
    StereoObservation {
        t_ns: m.left.t_capture_ns,
        left_uv: (m.left.u, m.left.v),
        right_uv: (m.right.u, m.right.v),
        x_ft,
        y_ft,
        z_ft,
        quality: if in_range { 1.0 } else { 0.0 },
        confidence: if in_range { m.score } else { 0.0 },
    }
}

/// A detected-frame item queued per camera while waiting to be paired.
pub type CameraFrame = (Frame, Vec<Detection>);

/// Outcome of one pairing attempt (§4.4 steps 1-4).
pub enum PairOutcome {
    /// Neither buffer has data, or the delay is a wait-for-more-data gap.
    Empty,
    /// `delta_ns` exceeded tolerance; the older head (by camera) was dropped.
    Dropped { dropped_camera: CameraId, delta_ns: i64 },
    /// Both heads popped: `(left, right, delta_ns)`.
    Paired(CameraFrame, CameraFrame, i64),
}

/// Owns the two per-camera ring buffers and the timing tolerance. Pure
/// pairing logic; does not know about the event bus or ROI gates so it can
/// be unit tested in isolation.
pub struct StereoPairer {
    left_buf: RingBuffer<CameraFrame>,
    right_buf: RingBuffer<CameraFrame>,
    tolerance_ns: i64,
}

impl StereoPairer {
    pub fn new(buffer_capacity: usize, tolerance_ns: i64) -> Self {
        Self {
            left_buf: RingBuffer::new(buffer_capacity),
            right_buf: RingBuffer::new(buffer_capacity),
            tolerance_ns,
        }
    }

    pub fn push(&mut self, camera_id: CameraId, item: CameraFrame) {
        match camera_id {
            CameraId::Left => {
                self.left_buf.push_drop_oldest(item);
            }
            CameraId::Right => {
                self.right_buf.push_drop_oldest(item);
            }
        }
    }

    /// One step of the §4.4 pairing loop. Call repeatedly (e.g. in a `while
    /// let`) until it returns [`PairOutcome::Empty`].
    pub fn try_pop_pair(&mut self) -> PairOutcome {
        let (Some(lf), Some(rf)) = (self.left_buf.front(), self.right_buf.front()) else {
            return PairOutcome::Empty;
        };
        let delta = lf.0.t_capture_ns - rf.0.t_capture_ns;
        if delta.abs() > self.tolerance_ns {
            if delta < 0 {
                let dropped = self.left_buf.pop_front().expect("front just observed");
                return PairOutcome::Dropped {
                    dropped_camera: dropped.0.camera_id,
                    delta_ns: delta.abs(),
                };
            } else {
                let dropped = self.right_buf.pop_front().expect("front just observed");
                return PairOutcome::Dropped {
                    dropped_camera: dropped.0.camera_id,
                    delta_ns: delta.abs(),
                };
            }
        }
        let left = self.left_buf.pop_front().expect("front just observed");
        let right = self.right_buf.pop_front().expect("front just observed");
        PairOutcome::Paired(left, right, delta.abs())
    }
}

/// Result of [`process_pair`]: triangulated observations plus the two raw
/// pre-triangulation detection counts C6's activation rule (§4.5) needs.
/// Kept distinct from `observations.len()` per `pipeline_service.py`'s
/// `_update_plate_metrics` (`lane_count = len(left_gated) + len(right_gated)`,
/// `plate_count = len(plate_left) + len(plate_right)`, both computed before
/// stereo matching, not from the matched/triangulated result).
pub struct ProcessedPair {
    pub observations: Vec<StereoObservation>,
    pub lane_count: usize,
    pub plate_count: usize,
}

/// Full §4.4 step 1-7 pipeline for one already-paired (left, right) frame:
/// lane gate, plate gate (optional), epipolar pre-filter, stereo lane gate,
/// triangulation. Observations are returned in the order produced (all share
/// one `t_ns`, so within-pair ordering is trivially non-decreasing).
#[allow(clippy::too_many_arguments)]
pub fn process_pair(
    left: &CameraFrame,
    right: &CameraFrame,
    lane_gate: &RoiGate,
    plate_gate: Option<&RoiGate>,
    geometry: &StereoGeometry,
) -> ProcessedPair {
    let left_lane = lane_gate.filter(&left.1);
    let right_lane = lane_gate.filter(&right.1);
    let lane_count = left_lane.len() + right_lane.len();

    let matches = epipolar_candidates(&left_lane, &right_lane, geometry.epipolar_epsilon_px);

    // "Filter through stereo lane gate: keep only matches whose both
    // endpoints passed the lane gate" -- already guaranteed since matches
    // are built only from lane-gated detections. The plate gate, if
    // present, additionally requires both endpoints fall in the plate ROI.
    let (matches, plate_count) = if let Some(plate) = plate_gate {
        let plate_count = plate.filter(&left_lane).len() + plate.filter(&right_lane).len();
        let matches = matches
            .into_iter()
            .filter(|m| plate.contains(&m.left) && plate.contains(&m.right))
            .collect();
        (matches, plate_count)
    } else {
        (matches, 0)
    };

    let observations = matches.iter().map(|m| triangulate(m, geometry)).collect();
    ProcessedPair { observations, lane_count, plate_count }
}
