//! Pitch state machine (C6, §4.5).
//!
//! This is the Rust rendering of `pitch_tracking_v2.py::PitchStateMachineV2`
//! -- the "v2" design is the one this spec follows per §9's Open Questions
//! (the v1 machine in the original is superseded: no pre-roll, no ramp-up
//! capture, no reversion). Thread safety is a single `parking_lot::Mutex`
//! over all mutable state, the same "one lock over all state" shape as
//! `PitchStateMachineV2`'s `threading.RLock`; Rust's non-reentrant
//! `Mutex` is sufficient here because the machine never calls back into its
//! own locked methods while holding the lock -- event publication happens
//! after the lock is released (mirroring how `EventBus::publish` itself
//! releases its lock before invoking handlers).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event_bus::EventBus;
use crate::events::{ErrorEvent, PitchEnd, PitchStart};
use crate::ring_buffer::RingBuffer;
use crate::types::{CameraId, Frame, PitchData, PitchPhase, StereoObservation};

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PitchConfig {
    pub min_active_frames: u32,
    pub end_gap_frames: u32,
    pub use_plate_gate: bool,
    pub min_observations: usize,
    pub min_duration_ns: i64,
    pub pre_roll_ns: i64,
}

impl Default for PitchConfig {
    fn default() -> Self {
        Self {
            min_active_frames: 5,
            end_gap_frames: 10,
            use_plate_gate: true,
            min_observations: 3,
            min_duration_ns: 100_000_000,
            pre_roll_ns: 300_000_000,
        }
    }
}

/// One entry in the bounded debugging event log (§4.5 "Event log").
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub t_ns: i64,
    pub kind: &'static str,
    pub data: Vec<(&'static str, String)>,
}

const EVENT_LOG_CAPACITY: usize = 1000;
const PRE_ROLL_RING_CAPACITY: usize = 512;

struct Inner {
    config: PitchConfig,
    phase: PitchPhase,
    pitch_index: u32,

    first_detection_ns: i64,
    last_detection_ns: i64,
    active_frame_count: u32,
    gap_frame_count: u32,

    observations: Vec<StereoObservation>,
    ramp_up_observations: Vec<StereoObservation>,

    pre_roll: [RingBuffer<Frame>; 2],

    event_log: VecDeque<EventLogEntry>,
}

fn camera_slot(id: CameraId) -> usize {
    match id {
        CameraId::Left => 0,
        CameraId::Right => 1,
    }
}

impl Inner {
    fn new(config: PitchConfig) -> Self {
        Self {
            config,
            phase: PitchPhase::Inactive,
            pitch_index: 0,
            first_detection_ns: 0,
            last_detection_ns: 0,
            active_frame_count: 0,
            gap_frame_count: 0,
            observations: Vec::new(),
            ramp_up_observations: Vec::new(),
            pre_roll: [
                RingBuffer::new(PRE_ROLL_RING_CAPACITY),
                RingBuffer::new(PRE_ROLL_RING_CAPACITY),
            ],
            event_log: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
        }
    }

    fn log_event(&mut self, t_ns: i64, kind: &'static str, data: Vec<(&'static str, String)>) {
        if self.event_log.len() == EVENT_LOG_CAPACITY {
            self.event_log.pop_front();
        }
        self.event_log.push_back(EventLogEntry { t_ns, kind, data });
    }

    fn capture_pre_roll(&self) -> Vec<(CameraId, Frame)> {
        let mut out = Vec::new();
        for (id, slot) in [(CameraId::Left, 0), (CameraId::Right, 1)] {
            for frame in self.pre_roll[slot].iter() {
                out.push((id, frame.clone()));
            }
        }
        out
    }

    fn is_frame_active(&self, lane_count: usize, plate_count: usize, obs_count: usize) -> bool {
        if self.config.use_plate_gate {
            plate_count > 0 || obs_count > 0
        } else {
            lane_count > 0
        }
    }
}

/// Thread-safe handle to the pitch state machine. Cloning shares the
/// underlying state (same `Arc` pattern as [`crate::event_bus::EventBus`]).
#[derive(Clone)]
pub struct PitchStateMachine {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
}

impl PitchStateMachine {
    pub fn new(config: PitchConfig, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(config))),
            bus,
        }
    }

    /// §4.5 "Per-camera pre-roll ring": called for every captured frame,
    /// including while `Inactive`.
    pub fn buffer_frame(&self, camera_id: CameraId, frame: Frame) {
        let mut inner = self.inner.lock();
        let cutoff = frame.t_capture_ns - inner.config.pre_roll_ns;
        let slot = camera_slot(camera_id);
        inner.pre_roll[slot].push_drop_oldest(frame);
        inner.pre_roll[slot].trim_front_while(|f| f.t_capture_ns < cutoff);
    }

    /// §4.5 "Observation routing".
    pub fn add_observation(&self, obs: StereoObservation) {
        let mut inner = self.inner.lock();
        match inner.phase {
            PitchPhase::Active => inner.observations.push(obs),
            PitchPhase::RampUp => inner.ramp_up_observations.push(obs),
            PitchPhase::Inactive | PitchPhase::Ending | PitchPhase::Finalized => {}
        }
    }

    pub fn phase(&self) -> PitchPhase {
        self.inner.lock().phase
    }

    pub fn pitch_index(&self) -> u32 {
        self.inner.lock().pitch_index
    }

    pub fn observation_count(&self) -> usize {
        self.inner.lock().observations.len()
    }

    pub fn event_log(&self) -> Vec<EventLogEntry> {
        self.inner.lock().event_log.iter().cloned().collect()
    }

    /// Rejected (returns `false`) unless currently `Inactive` (§4.5 "Thread
    /// safety").
    pub fn update_config(&self, config: PitchConfig) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != PitchPhase::Inactive {
            tracing::warn!(phase = ?inner.phase, "rejected config update outside Inactive phase");
            return false;
        }
        inner.config = config;
        inner.log_event(0, "config_updated", vec![]);
        true
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.log_event(0, "reset", vec![]);
        inner.phase = PitchPhase::Inactive;
        inner.pitch_index = 0;
        inner.first_detection_ns = 0;
        inner.last_detection_ns = 0;
        inner.active_frame_count = 0;
        inner.gap_frame_count = 0;
        inner.observations.clear();
        inner.ramp_up_observations.clear();
        for ring in &mut inner.pre_roll {
            ring.drain().for_each(drop);
        }
    }

    /// Force the current pitch to end, e.g. on session shutdown.
    pub fn force_end(&self, current_ns: Option<i64>) {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, PitchPhase::Active | PitchPhase::RampUp) {
            let end_ns = current_ns.unwrap_or(inner.last_detection_ns);
            inner.log_event(end_ns, "force_end", vec![]);
            drop(inner);
            self.transition_to_finalized(end_ns);
        }
    }

    /// §4.5 "Update routine": called once per paired frame.
    pub fn update(&self, frame_ns: i64, lane_count: usize, plate_count: usize, obs_count: usize) {
        let active = {
            let mut inner = self.inner.lock();
            let active = inner.is_frame_active(lane_count, plate_count, obs_count);
            inner.log_event(
                frame_ns,
                "update",
                vec![("active", active.to_string()), ("obs_count", obs_count.to_string())],
            );
            active
        };

        if active {
            self.handle_active_frame(frame_ns);
        } else {
            self.handle_inactive_frame(frame_ns);
        }
    }

    fn handle_active_frame(&self, frame_ns: i64) {
        enum Next {
            None,
            ToRampUp,
            ToActive,
            ResumeActive,
        }

        let next = {
            let mut inner = self.inner.lock();
            inner.gap_frame_count = 0;
            inner.active_frame_count += 1;
            inner.last_detection_ns = frame_ns;
            if inner.first_detection_ns == 0 {
                inner.first_detection_ns = frame_ns;
            }

            match inner.phase {
                PitchPhase::Inactive => {
                    inner.phase = PitchPhase::RampUp;
                    inner.log_event(frame_ns, "transition_ramp_up", vec![]);
                    Next::ToRampUp
                }
                PitchPhase::RampUp => {
                    let min_active = inner.config.min_active_frames;
                    let min_duration = inner.config.min_duration_ns;
                    let duration_ok = frame_ns - inner.first_detection_ns >= min_duration;
                    if inner.active_frame_count >= min_active && duration_ok {
                        Next::ToActive
                    } else {
                        Next::None
                    }
                }
                PitchPhase::Active => Next::None,
                PitchPhase::Ending => {
                    inner.phase = PitchPhase::Active;
                    inner.log_event(frame_ns, "ending_cancelled", vec![]);
                    Next::ResumeActive
                }
                PitchPhase::Finalized => Next::None,
            }
        };

        if matches!(next, Next::ToActive) {
            self.transition_to_active(frame_ns);
        }
    }

    fn handle_inactive_frame(&self, frame_ns: i64) {
        let mut inner = self.inner.lock();
        match inner.phase {
            PitchPhase::Inactive => {
                inner.active_frame_count = 0;
                inner.first_detection_ns = 0;
            }
            PitchPhase::RampUp => {
                inner.log_event(frame_ns, "ramp_up_failed", vec![]);
                inner.phase = PitchPhase::Inactive;
                inner.active_frame_count = 0;
                inner.gap_frame_count = 0;
                inner.first_detection_ns = 0;
                inner.last_detection_ns = 0;
                inner.ramp_up_observations.clear();
            }
            PitchPhase::Active => {
                inner.gap_frame_count += 1;
                if inner.gap_frame_count >= inner.config.end_gap_frames {
                    drop(inner);
                    self.transition_to_finalized(frame_ns);
                    return;
                }
            }
            PitchPhase::Ending | PitchPhase::Finalized => {}
        }
    }

    /// §4.5 "RampUp -> Active" transition: promote ramp-up observations,
    /// snapshot pre-roll, bump `pitch_index`, publish `PitchStart`, and -- if
    /// the publish reveals a downstream subscriber failure -- revert.
    fn transition_to_active(&self, frame_ns: i64) {
        let (pitch_data, reverted_observations) = {
            let mut inner = self.inner.lock();
            inner.phase = PitchPhase::Active;
            inner.pitch_index += 1;
            inner.log_event(frame_ns, "transition_active", vec![]);

            let previous_observations = inner.observations.clone();
            inner.observations.append(&mut inner.ramp_up_observations);

            let start_ns = inner.first_detection_ns;
            let pre_roll_frames = inner.capture_pre_roll();

            let pitch_data = PitchData {
                pitch_index: inner.pitch_index,
                phase: inner.phase,
                start_ns,
                end_ns: 0,
                first_detection_ns: inner.first_detection_ns,
                last_detection_ns: inner.last_detection_ns,
                observations: inner.observations.clone(),
                pre_roll_frames,
            };
            (pitch_data, previous_observations)
        };

        let failed = self.bus.publish_and_check(PitchStart {
            pitch_index: pitch_data.pitch_index,
            t_ns: pitch_data.start_ns,
            pre_roll_frames: pitch_data.pre_roll_frames.clone(),
        });

        if failed {
            tracing::error!(
                pitch_index = pitch_data.pitch_index,
                "PitchStart subscriber failed; reverting to RampUp"
            );
            let mut inner = self.inner.lock();
            inner.phase = PitchPhase::RampUp;
            inner.pitch_index -= 1;
            inner.observations = reverted_observations;
            inner.log_event(frame_ns, "pitch_start_reverted", vec![]);
            drop(inner);
            self.bus.publish(ErrorEvent {
                source: "pitch_state".to_string(),
                category: crate::error::ErrorCategory::Callback,
                severity: crate::error::ErrorSeverity::Error,
                message: "PitchStart publication failed; reverted to RampUp".to_string(),
                details: None,
            });
        }
    }

    /// §4.5 "Finalization".
    fn transition_to_finalized(&self, frame_ns: i64) {
        let (pitch_data, min_observations, min_duration_ns) = {
            let mut inner = self.inner.lock();
            let end_ns = if inner.last_detection_ns != 0 {
                inner.last_detection_ns
            } else {
                frame_ns
            };
            inner.log_event(end_ns, "transition_finalized", vec![]);

            let pitch_data = PitchData {
                pitch_index: inner.pitch_index,
                phase: PitchPhase::Finalized,
                start_ns: inner.first_detection_ns,
                end_ns,
                first_detection_ns: inner.first_detection_ns,
                last_detection_ns: inner.last_detection_ns,
                observations: inner.observations.clone(),
                pre_roll_frames: Vec::new(),
            };
            (pitch_data, inner.config.min_observations, inner.config.min_duration_ns)
        };

        if let Err(reason) = pitch_data.is_valid(min_observations, min_duration_ns) {
            tracing::warn!(pitch_index = pitch_data.pitch_index, reason, "pitch rejected");
            let mut inner = self.inner.lock();
            inner.log_event(frame_ns, "pitch_rejected", vec![("reason", reason)]);
            drop(inner);
            self.reset_for_next_pitch();
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.phase = PitchPhase::Finalized;
        }

        let failed = self.bus.publish_and_check(PitchEnd {
            pitch_index: pitch_data.pitch_index,
            phase: pitch_data.phase,
            observations: pitch_data.observations.clone(),
            t_ns: pitch_data.end_ns,
            duration_ns: pitch_data.duration_ns(),
        });
        if failed {
            tracing::error!(
                pitch_index = pitch_data.pitch_index,
                "PitchEnd subscriber failed; state already Finalized, not retrying"
            );
        }

        self.reset_for_next_pitch();
    }

    fn reset_for_next_pitch(&self) {
        let mut inner = self.inner.lock();
        inner.phase = PitchPhase::Inactive;
        inner.first_detection_ns = 0;
        inner.last_detection_ns = 0;
        inner.active_frame_count = 0;
        inner.gap_frame_count = 0;
        inner.observations.clear();
        inner.ramp_up_observations.clear();
        // pitch_index and pre-roll buffers are intentionally preserved.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageBuffer, PixelFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(camera_id: CameraId, t_ns: i64) -> Frame {
        Frame {
            camera_id,
            frame_index: 0,
            t_capture_ns: t_ns,
            image: ImageBuffer::new(vec![1, 2, 3]),
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Mono8,
        }
    }

    fn obs(t_ns: i64) -> StereoObservation {
        StereoObservation {
            t_ns,
            left_uv: (0.0, 0.0),
            right_uv: (0.0, 0.0),
            x_ft: 0.0,
            y_ft: 0.0,
            z_ft: 50.0,
            quality: 1.0,
            confidence: 0.9,
        }
    }

    /// Scenario 3 (§8): pre-roll capture.
    #[test]
    fn pre_roll_captures_frames_before_first_active_frame() {
        let bus = EventBus::new();
        let config = PitchConfig {
            min_active_frames: 3,
            pre_roll_ns: 100_000_000,
            ..Default::default()
        };
        let sm = PitchStateMachine::new(config, bus.clone());

        let starts: Arc<Mutex<Vec<PitchStart>>> = Arc::new(Mutex::new(Vec::new()));
        let s = starts.clone();
        bus.subscribe::<PitchStart, _>(move |e: &PitchStart| s.lock().push(e.clone()));

        let period_ns = 33_000_000i64;
        // 10 inactive frames, 33ms apart, buffered but not active.
        for i in 0..10 {
            let t = i * period_ns;
            sm.buffer_frame(CameraId::Left, frame(CameraId::Left, t));
            sm.update(t, 0, 0, 0);
        }
        // 5 active frames.
        let first_active_t = 10 * period_ns;
        for i in 0..5 {
            let t = first_active_t + i * period_ns;
            sm.buffer_frame(CameraId::Left, frame(CameraId::Left, t));
            sm.add_observation(obs(t));
            sm.update(t, 1, 1, 1);
        }

        let starts = starts.lock();
        assert_eq!(starts.len(), 1);
        let pre_roll = &starts[0].pre_roll_frames;
        assert!(pre_roll.len() >= 3);
        for (_, f) in pre_roll {
            assert!(f.t_capture_ns < first_active_t);
        }
    }

    /// Scenario 4 (§8): minimum-duration filter.
    #[test]
    fn short_bursts_do_not_start_a_pitch_long_ones_do() {
        let bus = EventBus::new();
        let config = PitchConfig {
            min_active_frames: 3,
            min_duration_ns: 100_000_000,
            ..Default::default()
        };
        let sm = PitchStateMachine::new(config, bus.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe::<PitchStart, _>(move |_: &PitchStart| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // 3 active frames 10ms apart: total 20ms < 100ms minimum.
        for i in 0..3 {
            let t = i * 10_000_000i64;
            sm.add_observation(obs(t));
            sm.update(t, 1, 1, 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sm.reset();

        // 6 active frames 33ms apart: total 165ms >= 100ms minimum.
        for i in 0..6 {
            let t = i * 33_000_000i64;
            sm.add_observation(obs(t));
            sm.update(t, 1, 1, 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Scenario 5 (§8): end time is last detection, not gap-elapsed frame.
    #[test]
    fn pitch_end_timestamp_is_last_detection_not_current_frame() {
        let bus = EventBus::new();
        let config = PitchConfig {
            min_active_frames: 3,
            end_gap_frames: 3,
            min_duration_ns: 0,
            min_observations: 1,
            ..Default::default()
        };
        let sm = PitchStateMachine::new(config, bus.clone());
        let ends: Arc<Mutex<Vec<PitchEnd>>> = Arc::new(Mutex::new(Vec::new()));
        let e = ends.clone();
        bus.subscribe::<PitchEnd, _>(move |ev: &PitchEnd| e.lock().push(ev.clone()));

        let period = 10_000_000i64;
        let mut last_active_t = 0i64;
        for i in 0..10 {
            let t = i * period;
            last_active_t = t;
            sm.add_observation(obs(t));
            sm.update(t, 1, 1, 1);
        }
        for i in 10..13 {
            let t = i * period;
            sm.update(t, 0, 0, 0);
        }

        let ends = ends.lock();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].t_ns, last_active_t);
    }

    /// Scenario 6 (§8): callback-failure reversion.
    #[test]
    fn pitch_start_callback_failure_reverts_state() {
        let bus = EventBus::new();
        let config = PitchConfig {
            min_active_frames: 2,
            min_duration_ns: 0,
            ..Default::default()
        };
        let sm = PitchStateMachine::new(config, bus.clone());
        bus.subscribe::<PitchStart, _>(|_: &PitchStart| panic!("subscriber exploded"));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        bus.subscribe::<ErrorEvent, _>(move |_: &ErrorEvent| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        for i in 0..2 {
            let t = i * 10_000_000i64;
            sm.add_observation(obs(t));
            sm.update(t, 1, 1, 1);
        }
        std::panic::set_hook(prev_hook);

        assert_eq!(sm.phase(), PitchPhase::RampUp);
        assert_eq!(sm.pitch_index(), 0);
        assert_eq!(sm.observation_count(), 2, "observations retained across reversion");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_all_state() {
        let bus = EventBus::new();
        let sm = PitchStateMachine::new(PitchConfig::default(), bus);
        sm.buffer_frame(CameraId::Left, frame(CameraId::Left, 0));
        sm.update(0, 1, 1, 1);
        sm.reset();
        assert_eq!(sm.phase(), PitchPhase::Inactive);
        assert_eq!(sm.pitch_index(), 0);
        assert_eq!(sm.observation_count(), 0);
    }

    #[test]
    fn update_config_rejected_outside_inactive() {
        let bus = EventBus::new();
        let sm = PitchStateMachine::new(PitchConfig::default(), bus);
        sm.update(0, 1, 1, 1); // -> RampUp
        assert_eq!(sm.phase(), PitchPhase::RampUp);
        assert!(!sm.update_config(PitchConfig::default()));
        sm.reset();
        assert!(sm.update_config(PitchConfig::default()));
    }
}
