//! `pitchtrack` binary: headless pipeline runner atop `pitchtrack-core`.
//!
//! Only the `sim` backend is implemented in-crate (a synthetic camera and
//! detector pair that manufacture a handful of pitches); `uvc`/`opencv` are
//! accepted as CLI values so a downstream embedder's binary can match this
//! surface, but this binary itself does not carry device drivers (out of
//! scope per the core crate's Non-goals).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use pitchtrack_core::analysis::AnalysisDispatcher;
use pitchtrack_core::capture::CaptureConfig;
use pitchtrack_core::collaborators::{
    Analyzer, CameraControls, CameraDevice, CameraMode, CameraStats, Detector, PitchSummary,
    ReadOutcome,
};
use pitchtrack_core::detection_pool::{DetectionPoolConfig, ThreadingMode};
use pitchtrack_core::error::Result as CoreResult;
use pitchtrack_core::events::{ErrorEvent, ObservationDetected, PitchEnd, PitchStart};
use pitchtrack_core::pitch_state::PitchConfig;
use pitchtrack_core::roi::{Polygon, RoiGate};
use pitchtrack_core::stereo::StereoGeometry;
use pitchtrack_core::types::{CameraId, Detection, Frame, ImageBuffer, PitchData, PixelFormat};
use pitchtrack_core::{Orchestrator, OrchestratorConfig};

#[derive(Debug, Parser)]
#[command(name = "pitchtrack", author, version, about = "stereo pitch-tracking pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture -> detection -> stereo -> pitch pipeline headlessly.
    Start(StartArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Uvc,
    Opencv,
    Sim,
}

#[derive(Debug, Parser)]
struct StartArgs {
    /// Camera backend. Only `sim` is implemented by this binary.
    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,

    /// Left camera identifier (backend-specific; used for logging only by `sim`).
    #[arg(long, default_value = "0")]
    left: String,

    /// Right camera identifier.
    #[arg(long, default_value = "1")]
    right: String,

    /// Number of left-camera frames to capture before stopping.
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Log triangulated X/Y/Z alongside each stereo match.
    #[arg(long)]
    stereo: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => run_start(args),
    }
}

fn run_start(args: StartArgs) -> Result<()> {
    if args.backend != Backend::Sim {
        bail!(
            "backend {:?} is not implemented by this binary; pass --backend sim, or implement \
             `CameraDevice`/`Detector` for {:?} in an embedding application",
            args.backend,
            args.backend,
        );
    }

    let orchestrator = Arc::new(Orchestrator::new(default_config()));
    let dispatcher = AnalysisDispatcher::install(orchestrator.bus(), Box::new(SimAnalyzer), None);
    install_logging(&orchestrator, args.stereo);

    let captured_frames = Arc::new(AtomicU64::new(0));
    let cf = captured_frames.clone();
    orchestrator
        .bus()
        .subscribe::<pitchtrack_core::events::FrameCaptured, _>(move |event| {
            if event.camera_id == CameraId::Left {
                cf.fetch_add(1, Ordering::SeqCst);
            }
        });

    let start = Instant::now();
    let left: Box<dyn CameraDevice> = Box::new(SimCamera::new(CameraId::Left, start, args.left));
    let right: Box<dyn CameraDevice> = Box::new(SimCamera::new(CameraId::Right, start, args.right));
    orchestrator.start_capture(vec![(CameraId::Left, left), (CameraId::Right, right)])?;
    orchestrator.start_detection(ThreadingMode::PerCamera, 10, || Box::new(SimDetector))?;

    let deadline = Instant::now() + Duration::from_secs(60);
    while captured_frames.load(Ordering::SeqCst) < args.frames {
        if Instant::now() > deadline {
            tracing::warn!("timed out waiting for requested frame count");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    orchestrator.stop_detection();
    orchestrator.stop_capture();

    let summary = dispatcher.get_session_summary();
    tracing::info!(
        total_pitches = summary.total_pitches,
        strikes = summary.strikes,
        balls = summary.balls,
        "session complete"
    );

    Ok(())
}

fn default_config() -> OrchestratorConfig {
    let mut lane_map = HashMap::new();
    let full_frame = Polygon::new(vec![(0.0, 0.0), (1280.0, 0.0), (1280.0, 720.0), (0.0, 720.0)]);
    lane_map.insert(CameraId::Left, full_frame.clone());
    lane_map.insert(CameraId::Right, full_frame);

    OrchestratorConfig {
        capture: CaptureConfig::default(),
        detection: DetectionPoolConfig::default(),
        pitch: PitchConfig::default(),
        stereo: StereoGeometry {
            baseline_ft: 2.0,
            focal_length_px: 1000.0,
            cx: 320.0,
            cy: 240.0,
            epipolar_epsilon_px: 5.0,
            z_min_ft: 10.0,
            z_max_ft: 70.0,
        },
        pair_tolerance_ns: 16_000_000,
        pair_buffer_capacity: 6,
        lane_gate: RoiGate::new(lane_map),
        plate_gate: None,
    }
}

fn install_logging(orchestrator: &Orchestrator, verbose_stereo: bool) {
    orchestrator.bus().subscribe::<ObservationDetected, _>(move |event: &ObservationDetected| {
        if verbose_stereo {
            tracing::info!(
                t_ns = event.observation.t_ns,
                x_ft = event.observation.x_ft,
                y_ft = event.observation.y_ft,
                z_ft = event.observation.z_ft,
                confidence = event.confidence,
                "stereo_matches=1 stereo_gated={}",
                if event.observation.quality > 0.0 { 1 } else { 0 }
            );
        } else {
            tracing::debug!(t_ns = event.observation.t_ns, "observation");
        }
    });
    orchestrator.subscribe_pitch_start(|event: &PitchStart| {
        tracing::info!(pitch_index = event.pitch_index, t_ns = event.t_ns, "pitch_start");
    });
    orchestrator.subscribe_pitch_end(|event: &PitchEnd| {
        tracing::info!(
            pitch_index = event.pitch_index,
            duration_ns = event.duration_ns,
            observations = event.observations.len(),
            "pitch_end"
        );
    });
    orchestrator.bus().subscribe::<ErrorEvent, _>(|event: &ErrorEvent| {
        tracing::warn!(source = %event.source, category = ?event.category, severity = ?event.severity, "{}", event.message);
    });
}

/// Deterministic synthetic camera: emits a frame roughly every 10ms and, for
/// frame indices `[40, 70)`, a ball silhouette crossing the image so the
/// paired `sim` detector has something to find (producing a handful of
/// pitches over a few hundred frames).
struct SimCamera {
    camera_id: CameraId,
    label: String,
    start: Instant,
    frame_index: u64,
}

impl SimCamera {
    fn new(camera_id: CameraId, start: Instant, label: String) -> Self {
        Self { camera_id, label, start, frame_index: 0 }
    }
}

impl CameraDevice for SimCamera {
    fn open(&mut self, id: CameraId) -> CoreResult<()> {
        tracing::info!(camera_id = id.as_str(), label = %self.label, "opened sim camera");
        Ok(())
    }

    fn set_mode(&mut self, _mode: CameraMode) -> CoreResult<()> {
        Ok(())
    }

    fn set_controls(&mut self, _controls: CameraControls) -> CoreResult<()> {
        Ok(())
    }

    fn read_frame(&mut self, _timeout_ms: u32) -> CoreResult<ReadOutcome> {
        std::thread::sleep(Duration::from_millis(10));
        let t_capture_ns = self.start.elapsed().as_nanos() as i64;
        let frame = Frame {
            camera_id: self.camera_id,
            frame_index: self.frame_index,
            t_capture_ns,
            image: ImageBuffer::new(vec![1, 2, 3, 4]),
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Mono8,
        };
        self.frame_index += 1;
        Ok(ReadOutcome::Frame(frame))
    }

    fn get_stats(&self) -> CameraStats {
        CameraStats { frames_read: self.frame_index, timeouts: 0, errors: 0 }
    }

    fn close(&mut self) {
        tracing::info!(label = %self.label, "closed sim camera");
    }
}

/// Synthetic detector: reports one detection per frame while the frame index
/// falls within a repeating "pitch window", sweeping across the image so
/// triangulation yields a plausible in-range depth.
struct SimDetector;

const PITCH_WINDOW_LEN: u64 = 30;
const PITCH_PERIOD: u64 = 90;

impl Detector for SimDetector {
    fn detect(&mut self, frame: &Frame) -> CoreResult<Vec<Detection>> {
        let phase = frame.frame_index % PITCH_PERIOD;
        if phase >= PITCH_WINDOW_LEN {
            return Ok(Vec::new());
        }
        let progress = phase as f64 / PITCH_WINDOW_LEN as f64;
        let v = 100.0 + progress * 400.0;
        let u = match frame.camera_id {
            CameraId::Left => 320.0,
            CameraId::Right => 280.0, // 40px disparity -> ~50ft depth
        };
        Ok(vec![Detection {
            camera_id: frame.camera_id,
            frame_index: frame.frame_index,
            t_capture_ns: frame.t_capture_ns,
            u,
            v,
            radius_px: 6.0,
            confidence: 0.95,
        }])
    }
}

struct SimAnalyzer;

impl Analyzer for SimAnalyzer {
    fn analyze_pitch(&mut self, pitch: &PitchData) -> CoreResult<PitchSummary> {
        let is_strike = pitch.observations.iter().any(|o| o.quality > 0.0);
        Ok(PitchSummary {
            pitch_index: pitch.pitch_index,
            is_strike,
            zone_row: 1,
            zone_col: 1,
            speed_mph: 0.0,
        })
    }
}
