//! Lane / plate region-of-interest gating (§4.4 step 1-2).
//!
//! Grounded in `detect/lane.py`'s `LaneRoi`/`LaneGate`: a point-in-polygon
//! test (ray casting) per camera, evaluated once per detection.
//!
//! Per the Open Questions in §9, the ROI for a camera must be established at
//! initialization before any detection is issued — [`RoiGate::new`] takes the
//! full per-camera map up front rather than allowing lazy/partial
//! assignment, so there is no code path where a lookup can race a later
//! `set_roi` call.

use std::collections::HashMap;

use crate::types::{CameraId, Detection};

#[derive(Debug, Clone)]
pub struct Polygon {
    points: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    /// Even-odd ray-casting point-in-polygon test, ported from
    /// `detect/lane.py::LaneRoi.contains`.
    pub fn contains(&self, point: (f64, f64)) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let (x, y) = point;
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            let intersects =
                (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi + 1e-9) + xi;
            if intersects {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Per-camera polygon gate. Used for both the lane ROI and the (optional,
/// narrower) plate ROI — they're the same shape, just different polygons.
#[derive(Debug, Clone)]
pub struct RoiGate {
    by_camera: HashMap<CameraId, Polygon>,
}

impl RoiGate {
    pub fn new(by_camera: HashMap<CameraId, Polygon>) -> Self {
        Self { by_camera }
    }

    pub fn contains(&self, detection: &Detection) -> bool {
        self.by_camera
            .get(&detection.camera_id)
            .map(|roi| roi.contains((detection.u, detection.v)))
            .unwrap_or(false)
    }

    /// Keep only detections whose camera has a configured ROI containing the
    /// detection's pixel coordinates.
    pub fn filter<'a>(&self, detections: impl IntoIterator<Item = &'a Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| self.contains(d))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
    }

    #[test]
    fn point_inside_and_outside_square() {
        let p = square();
        assert!(p.contains((5.0, 5.0)));
        assert!(!p.contains((15.0, 5.0)));
        assert!(!p.contains((-1.0, 5.0)));
    }

    #[test]
    fn gate_filters_per_camera() {
        let mut map = HashMap::new();
        map.insert(CameraId::Left, square());
        let gate = RoiGate::new(map);

        let inside = Detection {
            camera_id: CameraId::Left,
            frame_index: 0,
            t_capture_ns: 0,
            u: 5.0,
            v: 5.0,
            radius_px: 2.0,
            confidence: 0.9,
        };
        let outside = Detection { u: 50.0, v: 50.0, ..inside };
        let no_roi_camera = Detection { camera_id: CameraId::Right, ..inside };

        let filtered = gate.filter(&[inside, outside, no_roi_camera]);
        assert_eq!(filtered, vec![inside]);
    }
}
