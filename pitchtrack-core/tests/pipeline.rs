//! End-to-end tests driving the full capture -> detection -> stereo -> pitch
//! pipeline through [`pitchtrack_core::Orchestrator`], the way
//! `flydra2/tests` and `image-tracker/tests/test-fmf-tracking.rs` exercise
//! their crates through the top-level struct rather than individual units.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;

use pitchtrack_core::analysis::AnalysisDispatcher;
use pitchtrack_core::capture::CaptureConfig;
use pitchtrack_core::collaborators::{
    Analyzer, CameraControls, CameraDevice, CameraMode, CameraStats, Detector, PitchSummary,
    ReadOutcome,
};
use pitchtrack_core::detection_pool::{DetectionPoolConfig, ThreadingMode};
use pitchtrack_core::error::Result as CoreResult;
use pitchtrack_core::events::PitchEnd;
use pitchtrack_core::pitch_state::PitchConfig;
use pitchtrack_core::roi::{Polygon, RoiGate};
use pitchtrack_core::stereo::StereoGeometry;
use pitchtrack_core::types::{CameraId, Detection, Frame, ImageBuffer, PitchData, PixelFormat};
use pitchtrack_core::{Orchestrator, OrchestratorConfig};

fn full_frame_gate() -> RoiGate {
    let mut map = HashMap::new();
    let poly = Polygon::new(vec![(0.0, 0.0), (2000.0, 0.0), (2000.0, 2000.0), (0.0, 2000.0)]);
    map.insert(CameraId::Left, poly.clone());
    map.insert(CameraId::Right, poly);
    RoiGate::new(map)
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        capture: CaptureConfig::default(),
        detection: DetectionPoolConfig::default(),
        pitch: PitchConfig {
            min_active_frames: 4,
            end_gap_frames: 3,
            use_plate_gate: false,
            min_observations: 4,
            min_duration_ns: 1_000_000,
            pre_roll_ns: 50_000_000,
        },
        stereo: StereoGeometry {
            baseline_ft: 2.0,
            focal_length_px: 1000.0,
            cx: 320.0,
            cy: 240.0,
            epipolar_epsilon_px: 5.0,
            z_min_ft: 10.0,
            z_max_ft: 70.0,
        },
        pair_tolerance_ns: 40_000_000,
        pair_buffer_capacity: 8,
        lane_gate: full_frame_gate(),
        plate_gate: None,
    }
}

/// Produces frames indefinitely, ~5ms apart, timestamped off a shared clock
/// so both cameras' frames land close enough together to pair. Keeping frame
/// production continuous (rather than stopping after a fixed schedule) is
/// what lets the gap counter in `pitch_state` actually advance once the
/// detector below stops reporting detections -- `update()` only runs when a
/// stereo pair resolves, so a camera that simply stops producing frames
/// would freeze the state machine in `Active` forever instead of finalizing.
struct ScriptedCamera {
    camera_id: CameraId,
    start: Instant,
    frame_index: u64,
}

impl ScriptedCamera {
    fn new(camera_id: CameraId, start: Instant) -> Self {
        Self { camera_id, start, frame_index: 0 }
    }
}

impl CameraDevice for ScriptedCamera {
    fn open(&mut self, _id: CameraId) -> CoreResult<()> {
        Ok(())
    }
    fn set_mode(&mut self, _mode: CameraMode) -> CoreResult<()> {
        Ok(())
    }
    fn set_controls(&mut self, _controls: CameraControls) -> CoreResult<()> {
        Ok(())
    }
    fn read_frame(&mut self, _timeout_ms: u32) -> CoreResult<ReadOutcome> {
        std::thread::sleep(Duration::from_millis(5));
        let t_capture_ns = self.start.elapsed().as_nanos() as i64;
        let frame_index = self.frame_index;
        self.frame_index += 1;
        Ok(ReadOutcome::Frame(Frame {
            camera_id: self.camera_id,
            frame_index,
            t_capture_ns,
            image: ImageBuffer::new(vec![7, 7, 7]),
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Mono8,
        }))
    }
    fn get_stats(&self) -> CameraStats {
        CameraStats::default()
    }
    fn close(&mut self) {}
}

const ACTIVE_WINDOW_FRAMES: u64 = 10;

/// Reports one in-lane detection per frame for the first `ACTIVE_WINDOW_FRAMES`
/// frames (fixed 40px disparity, ~50ft depth, inside the test geometry's
/// [10, 70] range), then nothing -- driving the pitch machine through
/// RampUp -> Active and then, once frames keep arriving with no detections,
/// through the gap count into Finalized.
struct AlwaysBallDetector;

impl Detector for AlwaysBallDetector {
    fn detect(&mut self, frame: &Frame) -> CoreResult<Vec<Detection>> {
        if frame.frame_index >= ACTIVE_WINDOW_FRAMES {
            return Ok(Vec::new());
        }
        let u = match frame.camera_id {
            CameraId::Left => 320.0,
            CameraId::Right => 280.0,
        };
        Ok(vec![Detection {
            camera_id: frame.camera_id,
            frame_index: frame.frame_index,
            t_capture_ns: frame.t_capture_ns,
            u,
            v: 200.0,
            radius_px: 5.0,
            confidence: 0.9,
        }])
    }
}

struct CountingAnalyzer {
    calls: Arc<AtomicU64>,
}

impl Analyzer for CountingAnalyzer {
    fn analyze_pitch(&mut self, pitch: &PitchData) -> CoreResult<PitchSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PitchSummary {
            pitch_index: pitch.pitch_index,
            is_strike: pitch.observations.iter().any(|o| o.quality > 0.0),
            zone_row: 1,
            zone_col: 1,
            speed_mph: 85.0,
        })
    }
}

fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

/// A continuous run of synchronized, lane-gated, in-range detections drives
/// the pitch machine through RampUp -> Active -> (gap) -> Finalized, the
/// analyzer is invoked, and the session summary reflects one recorded pitch.
#[test]
fn full_pipeline_produces_one_pitch_and_analyzer_summary() {
    let orchestrator = Orchestrator::new(test_config());

    let ends: Arc<PlMutex<Vec<PitchEnd>>> = Arc::new(PlMutex::new(Vec::new()));
    let e = ends.clone();
    orchestrator.subscribe_pitch_end(move |ev: &PitchEnd| e.lock().push(ev.clone()));

    let calls = Arc::new(AtomicU64::new(0));
    let dispatcher =
        AnalysisDispatcher::install(orchestrator.bus(), Box::new(CountingAnalyzer { calls: calls.clone() }), None);

    // The detector reports detections for ACTIVE_WINDOW_FRAMES frames (enough
    // to satisfy min_active_frames=4 and min_duration_ns), then none -- after
    // end_gap_frames=3 further paired-but-empty frames the pitch finalizes.
    let start = Instant::now();
    let left: Box<dyn CameraDevice> = Box::new(ScriptedCamera::new(CameraId::Left, start));
    let right: Box<dyn CameraDevice> = Box::new(ScriptedCamera::new(CameraId::Right, start));

    orchestrator
        .start_capture(vec![(CameraId::Left, left), (CameraId::Right, right)])
        .unwrap();
    orchestrator
        .start_detection(ThreadingMode::PerCamera, 10, || Box::new(AlwaysBallDetector))
        .unwrap();

    assert!(
        wait_for(|| !ends.lock().is_empty(), Duration::from_secs(10)),
        "expected a PitchEnd within 10s"
    );

    orchestrator.stop_detection();
    orchestrator.stop_capture();

    let ends = ends.lock();
    assert_eq!(ends.len(), 1);
    assert!(ends[0].observations.len() >= 4);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let summary = dispatcher.get_session_summary();
    assert_eq!(summary.total_pitches, 1);
    assert_eq!(summary.strikes, 1);
}

/// Scenario 7 (drop-oldest): a burst of frames published faster than the
/// detector can drain them never grows the per-camera queue past its
/// configured capacity, and capture itself never blocks or errors.
#[test]
fn detection_queue_drops_oldest_under_sustained_overload() {
    use pitchtrack_core::event_bus::EventBus;

    let bus = EventBus::new();
    let config = DetectionPoolConfig { queue_capacity: 4, ..Default::default() };
    let pool = pitchtrack_core::detection_pool::DetectionPool::new(bus.clone(), config);

    // Publish far more frames than the queue can hold before any worker
    // starts draining it.
    for i in 0..50 {
        bus.publish(pitchtrack_core::events::FrameCaptured {
            camera_id: CameraId::Left,
            t_ns: i,
            frame: Frame {
                camera_id: CameraId::Left,
                frame_index: i as u64,
                t_capture_ns: i,
                image: ImageBuffer::new(vec![1]),
                width: 1,
                height: 1,
                pixel_format: PixelFormat::Mono8,
            },
        });
    }

    let processed: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
    let p = processed.clone();
    bus.subscribe::<pitchtrack_core::detection_pool::DetectionPublished, _>(move |_| {
        *p.lock().unwrap() += 1;
    });
    pool.start_workers(ThreadingMode::PerCamera, 10, || Box::new(AlwaysBallDetector));

    std::thread::sleep(Duration::from_millis(200));
    pool.stop();

    // Far fewer than 50 frames survived the drop-oldest queue.
    assert!(*processed.lock().unwrap() < 50);
}
