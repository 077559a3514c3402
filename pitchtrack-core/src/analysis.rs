//! Analysis dispatcher (C9, §4.7).
//!
//! Subscribes to `PitchEnd`, hands each finalized pitch to an external
//! `Analyzer`, and aggregates the results into an in-memory `SessionSummary`
//! under a lock -- the same "subscribe once, aggregate under a lock, expose a
//! snapshot getter" shape `flydra2::tracking_core`'s stats aggregation uses
//! for its own rolling counters.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::collaborators::{Analyzer, PitchSummary, RecordingSink, SessionSummary};
use crate::error::{ErrorCategory, ErrorSeverity};
use crate::event_bus::EventBus;
use crate::events::{ErrorEvent, PitchEnd};
use crate::types::{PitchData, PitchPhase};

/// Thread-safe handle; cloning shares the underlying summary state.
#[derive(Clone)]
pub struct AnalysisDispatcher {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    analyzer: Box<dyn Analyzer>,
    recording_sink: Option<Arc<Mutex<dyn RecordingSink>>>,
    summary: SessionSummary,
}

impl AnalysisDispatcher {
    /// Registers a `PitchEnd` handler on `bus`. `recording_sink` is the same
    /// collaborator the orchestrator uses for `start_recording`/
    /// `stop_recording` (§4.6); when `None`, `get_recent_pitch_paths` always
    /// returns an empty list (§4.7, a tested behavior, not an error).
    pub fn install(
        bus: &EventBus,
        analyzer: Box<dyn Analyzer>,
        recording_sink: Option<Arc<Mutex<dyn RecordingSink>>>,
    ) -> Self {
        let dispatcher = Self {
            inner: Arc::new(Mutex::new(Inner {
                analyzer,
                recording_sink,
                summary: SessionSummary::default(),
            })),
        };

        let handle = dispatcher.clone();
        let bus_for_errors = bus.clone();
        bus.subscribe::<PitchEnd, _>(move |event: &PitchEnd| {
            handle.handle_pitch_end(event, &bus_for_errors);
        });

        dispatcher
    }

    fn handle_pitch_end(&self, event: &PitchEnd, bus: &EventBus) {
        let pitch_data = PitchData {
            pitch_index: event.pitch_index,
            phase: event.phase,
            start_ns: event.observations.first().map(|o| o.t_ns).unwrap_or(event.t_ns),
            end_ns: event.t_ns,
            first_detection_ns: event.observations.first().map(|o| o.t_ns).unwrap_or(0),
            last_detection_ns: event.t_ns,
            observations: event.observations.clone(),
            pre_roll_frames: Vec::new(),
        };

        let mut inner = self.inner.lock();
        let outcome = inner.analyzer.analyze_pitch(&pitch_data);
        let sink = inner.recording_sink.clone();
        if let Ok(summary) = &outcome {
            inner.summary.record(summary);
        }
        drop(inner);

        match outcome {
            Ok(_) => {
                if let Some(sink) = sink {
                    if let Err(e) = sink.lock().record_pitch(&pitch_data, PitchPhase::Finalized) {
                        tracing::warn!(error = %e, "failed to record finalized pitch");
                        bus.publish(ErrorEvent::new("analysis", &e));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(pitch_index = event.pitch_index, error = %e, "analyzer failed");
                bus.publish(ErrorEvent {
                    source: "analysis".to_string(),
                    category: ErrorCategory::Callback,
                    severity: ErrorSeverity::Error,
                    message: format!("analyzer failed for pitch {}: {e}", event.pitch_index),
                    details: None,
                });
            }
        }
    }

    pub fn get_session_summary(&self) -> SessionSummary {
        self.inner.lock().summary
    }

    /// §4.7 `get_recent_pitch_paths`: empty without a configured sink.
    pub fn get_recent_pitch_paths(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        match &inner.recording_sink {
            Some(sink) => sink.lock().recent_pitch_paths(n),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoObservation;

    struct StubAnalyzer {
        is_strike: bool,
    }
    impl Analyzer for StubAnalyzer {
        fn analyze_pitch(&mut self, pitch: &PitchData) -> crate::error::Result<PitchSummary> {
            Ok(PitchSummary {
                pitch_index: pitch.pitch_index,
                is_strike: self.is_strike,
                zone_row: 1,
                zone_col: 1,
                speed_mph: 90.0,
            })
        }
    }

    struct FailingAnalyzer;
    impl Analyzer for FailingAnalyzer {
        fn analyze_pitch(&mut self, _pitch: &PitchData) -> crate::error::Result<PitchSummary> {
            Err(crate::error::Error::Analyzer { message: "boom".to_string() })
        }
    }

    fn obs() -> StereoObservation {
        StereoObservation {
            t_ns: 1_000_000,
            left_uv: (0.0, 0.0),
            right_uv: (0.0, 0.0),
            x_ft: 0.0,
            y_ft: 0.0,
            z_ft: 55.0,
            quality: 1.0,
            confidence: 0.9,
        }
    }

    #[test]
    fn session_summary_aggregates_across_pitches() {
        let bus = EventBus::new();
        let dispatcher = AnalysisDispatcher::install(&bus, Box::new(StubAnalyzer { is_strike: true }), None);

        bus.publish(PitchEnd {
            pitch_index: 1,
            phase: PitchPhase::Finalized,
            observations: vec![obs()],
            t_ns: 1_000_000,
            duration_ns: 100_000_000,
        });
        bus.publish(PitchEnd {
            pitch_index: 2,
            phase: PitchPhase::Finalized,
            observations: vec![obs()],
            t_ns: 2_000_000,
            duration_ns: 100_000_000,
        });

        let summary = dispatcher.get_session_summary();
        assert_eq!(summary.total_pitches, 2);
        assert_eq!(summary.strikes, 2);
    }

    #[test]
    fn recent_pitch_paths_empty_without_sink() {
        let bus = EventBus::new();
        let dispatcher = AnalysisDispatcher::install(&bus, Box::new(StubAnalyzer { is_strike: false }), None);
        assert!(dispatcher.get_recent_pitch_paths(5).is_empty());
    }

    #[test]
    fn analyzer_failure_emits_error_event_and_does_not_panic() {
        let bus = EventBus::new();
        let errors = Arc::new(Mutex::new(0u32));
        let e = errors.clone();
        bus.subscribe::<ErrorEvent, _>(move |_: &ErrorEvent| {
            *e.lock() += 1;
        });
        let dispatcher = AnalysisDispatcher::install(&bus, Box::new(FailingAnalyzer), None);

        bus.publish(PitchEnd {
            pitch_index: 1,
            phase: PitchPhase::Finalized,
            observations: vec![obs()],
            t_ns: 1_000_000,
            duration_ns: 100_000_000,
        });

        assert_eq!(*errors.lock(), 1);
        assert_eq!(dispatcher.get_session_summary().total_pitches, 0);
    }
}
