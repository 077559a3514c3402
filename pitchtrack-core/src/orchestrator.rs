//! Orchestrator (C7, §4.6).
//!
//! Wires C3-C6 through the event bus, enforces the capture -> detection ->
//! recording lifecycle, and exposes the control surface. Grounded in the
//! teacher's `flydra2::CoordProcessor`/`braid` binary relationship: a single
//! struct that owns the long-lived subsystems and is the one place lifecycle
//! invariants are enforced, rather than scattering `if capture_running` guard
//! checks across callers.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::capture::{CaptureConfig, CaptureService};
use crate::collaborators::{CameraDevice, Detector, RecordingSink};
use crate::detection_pool::{DetectionPool, DetectionPoolConfig, DetectionResult, ThreadingMode};
use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use crate::events::{ObservationDetected, PitchEnd, PitchStart};
use crate::pitch_state::{PitchConfig, PitchStateMachine};
use crate::roi::RoiGate;
use crate::stereo::{process_pair, PairOutcome, StereoGeometry, StereoPairer};
use crate::sync_monitor::SyncMonitor;
use crate::types::{CameraId, StereoObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    Capturing,
    Detecting,
    Recording,
}

pub struct OrchestratorConfig {
    pub capture: CaptureConfig,
    pub detection: DetectionPoolConfig,
    pub pitch: PitchConfig,
    pub stereo: StereoGeometry,
    pub pair_tolerance_ns: i64,
    pub pair_buffer_capacity: usize,
    pub lane_gate: RoiGate,
    pub plate_gate: Option<RoiGate>,
}

/// Snapshot returned by `get_stats` (§4.6).
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub pitch_index: u32,
    pub phase: Option<crate::types::PitchPhase>,
    pub bus_published: u64,
    pub bus_handler_errors: u64,
}

pub struct Orchestrator {
    bus: EventBus,
    capture: Arc<CaptureService>,
    capture_config: CaptureConfig,
    detection_config: DetectionPoolConfig,
    detection_pool: Mutex<Option<Arc<DetectionPool>>>,
    pairer: Arc<Mutex<StereoPairer>>,
    sync_monitor: Arc<Mutex<SyncMonitor>>,
    pitch_state: PitchStateMachine,
    latest_observation: Arc<Mutex<Option<StereoObservation>>>,
    recording_sink: Mutex<Option<Arc<Mutex<dyn RecordingSink>>>>,
    state: Arc<RwLock<LifecycleState>>,
    lane_gate: Arc<RoiGate>,
    plate_gate: Arc<Option<RoiGate>>,
    geometry: Arc<Mutex<StereoGeometry>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let bus = EventBus::new();
        let pitch_state = PitchStateMachine::new(config.pitch, bus.clone());
        let pairer = Arc::new(Mutex::new(StereoPairer::new(
            config.pair_buffer_capacity,
            config.pair_tolerance_ns,
        )));
        let sync_monitor = Arc::new(Mutex::new(SyncMonitor::new()));
        let lane_gate = Arc::new(config.lane_gate);
        let plate_gate = Arc::new(config.plate_gate);
        let geometry = Arc::new(Mutex::new(config.stereo));

        let orch = Self {
            bus: bus.clone(),
            capture: Arc::new(CaptureService::new(bus.clone())),
            capture_config: config.capture,
            detection_config: config.detection,
            detection_pool: Mutex::new(None),
            pairer,
            sync_monitor,
            pitch_state,
            latest_observation: Arc::new(Mutex::new(None)),
            recording_sink: Mutex::new(None),
            state: Arc::new(RwLock::new(LifecycleState::Idle)),
            lane_gate,
            plate_gate,
            geometry,
        };

        orch.wire_pipeline();
        orch
    }

    /// Connects C4's `DetectionPublished` results into C5's pairing buffer,
    /// feeding matched pairs through triangulation and into C6, and routes
    /// `ObservationDetected` + `PitchStart`/`PitchEnd` for the summary
    /// bookkeeping described in §4.6.
    fn wire_pipeline(&self) {
        let pairer = self.pairer.clone();
        let sync_monitor = self.sync_monitor.clone();
        let lane_gate = self.lane_gate.clone();
        let plate_gate = self.plate_gate.clone();
        let geometry = self.geometry.clone();
        let bus = self.bus.clone();
        let pitch_state = self.pitch_state.clone();

        self.bus
            .subscribe::<crate::detection_pool::DetectionPublished, _>(move |event: &crate::detection_pool::DetectionPublished| {
                let DetectionResult { camera_id, frame, detections } = event.0.clone();
                pitch_state.buffer_frame(camera_id, frame.clone());

                let mut pairer = pairer.lock();
                pairer.push(camera_id, (frame, detections));
                loop {
                    match pairer.try_pop_pair() {
                        PairOutcome::Empty => break,
                        PairOutcome::Dropped { .. } => {
                            sync_monitor.lock().record_dropped();
                        }
                        PairOutcome::Paired(left, right, delta_ns) => {
                            sync_monitor.lock().record_accepted(delta_ns);
                            if let Some(stats) = sync_monitor.lock().check_for_warning() {
                                tracing::warn!(?stats, "stereo sync drift exceeds threshold");
                            }
                            let geom = *geometry.lock();
                            let pair_result = process_pair(
                                &left,
                                &right,
                                &lane_gate,
                                plate_gate.as_ref().as_ref(),
                                &geom,
                            );
                            for obs in &pair_result.observations {
                                bus.publish(ObservationDetected {
                                    observation: *obs,
                                    confidence: obs.confidence,
                                });
                                pitch_state.add_observation(*obs);
                            }
                            pitch_state.update(
                                right.0.t_capture_ns,
                                pair_result.lane_count,
                                pair_result.plate_count,
                                pair_result.observations.len(),
                            );
                        }
                    }
                }
            });

        let latest_observation = self.latest_observation.clone();
        self.bus.subscribe::<ObservationDetected, _>(move |event: &ObservationDetected| {
            *latest_observation.lock() = Some(event.observation);
        });
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe_pitch_end(&self, handler: impl Fn(&PitchEnd) + Send + Sync + 'static) {
        self.bus.subscribe::<PitchEnd, _>(handler);
    }

    pub fn subscribe_pitch_start(&self, handler: impl Fn(&PitchStart) + Send + Sync + 'static) {
        self.bus.subscribe::<PitchStart, _>(handler);
    }

    /// §4.6 "Enforce lifecycle: capture must be running before detection".
    pub fn start_capture(
        &self,
        cameras: Vec<(CameraId, Box<dyn CameraDevice>)>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if *state != LifecycleState::Idle {
            return Err(Error::Protocol {
                message: "capture already started".to_string(),
            });
        }
        self.capture.start(cameras, self.capture_config)?;
        *state = LifecycleState::Capturing;
        Ok(())
    }

    pub fn stop_capture(&self) {
        self.capture.stop(&self.capture_config);
        let mut state = self.state.write();
        if *state != LifecycleState::Idle {
            *state = LifecycleState::Idle;
        }
    }

    /// §4.6 "detection before recording": requires capture to already be
    /// running.
    pub fn start_detection(
        &self,
        mode: ThreadingMode,
        error_threshold: u32,
        detector_factory: impl FnMut() -> Box<dyn Detector>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if *state != LifecycleState::Capturing {
            return Err(Error::Protocol {
                message: "detection requires capture to be running".to_string(),
            });
        }
        let pool = DetectionPool::new(self.bus.clone(), self.detection_config);
        pool.start_workers(mode, error_threshold, detector_factory);
        *self.detection_pool.lock() = Some(pool);
        *state = LifecycleState::Detecting;
        Ok(())
    }

    pub fn stop_detection(&self) {
        if let Some(pool) = self.detection_pool.lock().take() {
            pool.stop();
        }
        let mut state = self.state.write();
        if *state == LifecycleState::Detecting {
            *state = LifecycleState::Capturing;
        }
    }

    /// §4.6 "recording must be stopped before capture [stop]" -- i.e.
    /// recording requires capture+detection already running.
    pub fn start_recording(
        &self,
        session_name: &str,
        sink: Arc<Mutex<dyn RecordingSink>>,
    ) -> Result<Option<String>> {
        {
            let state = self.state.read();
            if *state != LifecycleState::Detecting {
                return Err(Error::Protocol {
                    message: "recording requires capture and detection to be running".to_string(),
                });
            }
        }
        let warning = sink.lock().start_session(session_name)?;
        *self.recording_sink.lock() = Some(sink);
        *self.state.write() = LifecycleState::Recording;
        Ok(warning)
    }

    pub fn stop_recording(&self) -> Result<Option<String>> {
        let sink = self.recording_sink.lock().take();
        let result = match &sink {
            Some(sink) => Some(sink.lock().stop_session()?),
            None => None,
        };
        let mut state = self.state.write();
        if *state == LifecycleState::Recording {
            *state = LifecycleState::Detecting;
        }
        Ok(result)
    }

    /// The same sink handle used by `start_recording`, if recording is
    /// currently active -- shared with an `AnalysisDispatcher` so both see
    /// the one underlying collaborator.
    pub fn recording_sink(&self) -> Option<Arc<Mutex<dyn RecordingSink>>> {
        self.recording_sink.lock().clone()
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let bus_stats = self.bus.stats();
        OrchestratorStats {
            pitch_index: self.pitch_state.pitch_index(),
            phase: Some(self.pitch_state.phase()),
            bus_published: bus_stats.published,
            bus_handler_errors: bus_stats.handler_errors,
        }
    }

    pub fn get_latest_observation(&self) -> Option<StereoObservation> {
        *self.latest_observation.lock()
    }

    pub fn get_preview_frames(&self) -> Vec<(CameraId, Option<crate::types::Frame>)> {
        self.capture.get_preview_frames()
    }

    pub fn set_detector_config(&self, geometry: StereoGeometry) {
        *self.geometry.lock() = geometry;
    }
}
