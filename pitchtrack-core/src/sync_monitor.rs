//! Stereo sync quality monitor (C8, §4.4 "Sync monitoring").
//!
//! Keeps a rolling window of the last 100 accepted pairing deltas and
//! evaluates drift thresholds every 100 accepted pairs, throttled to at most
//! one warning per 60 wall-clock seconds.

use std::time::{Duration, Instant};

const WINDOW: usize = 100;
const EVAL_EVERY: u64 = 100;
const WARN_THROTTLE: Duration = Duration::from_secs(60);

const MEAN_THRESHOLD_NS: i64 = 10_000_000;
const P95_THRESHOLD_NS: i64 = 20_000_000;
const MAX_THRESHOLD_NS: i64 = 50_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub mean_ns: i64,
    pub p95_ns: i64,
    pub max_ns: i64,
    pub drop_rate: f64,
}

impl SyncStats {
    pub fn exceeds_threshold(&self) -> bool {
        self.mean_ns > MEAN_THRESHOLD_NS
            || self.p95_ns > P95_THRESHOLD_NS
            || self.max_ns > MAX_THRESHOLD_NS
    }
}

pub struct SyncMonitor {
    deltas: std::collections::VecDeque<i64>,
    accepted_since_eval: u64,
    accepted_total: u64,
    dropped_total: u64,
    last_warning: Option<Instant>,
}

impl Default for SyncMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMonitor {
    pub fn new() -> Self {
        Self {
            deltas: std::collections::VecDeque::with_capacity(WINDOW),
            accepted_since_eval: 0,
            accepted_total: 0,
            dropped_total: 0,
            last_warning: None,
        }
    }

    pub fn record_accepted(&mut self, delta_ns: i64) {
        if self.deltas.len() == WINDOW {
            self.deltas.pop_front();
        }
        self.deltas.push_back(delta_ns);
        self.accepted_total += 1;
        self.accepted_since_eval += 1;
    }

    pub fn record_dropped(&mut self) {
        self.dropped_total += 1;
    }

    fn compute_stats(&self) -> SyncStats {
        if self.deltas.is_empty() {
            return SyncStats::default();
        }
        let mut sorted: Vec<i64> = self.deltas.iter().copied().collect();
        sorted.sort_unstable();
        let sum: i64 = sorted.iter().sum();
        let mean = sum / sorted.len() as i64;
        let p95_idx = ((sorted.len() as f64) * 0.95).floor() as usize;
        let p95_idx = p95_idx.min(sorted.len() - 1);
        let total_pairs = self.accepted_total + self.dropped_total;
        let drop_rate = if total_pairs > 0 {
            self.dropped_total as f64 / total_pairs as f64
        } else {
            0.0
        };
        SyncStats {
            mean_ns: mean,
            p95_ns: sorted[p95_idx],
            max_ns: *sorted.last().unwrap(),
            drop_rate,
        }
    }

    /// Returns `Some(stats)` exactly when this accepted-pair count is a
    /// multiple of 100 AND thresholds are exceeded AND the 60s throttle has
    /// elapsed -- i.e. when the caller should actually emit a warning.
    pub fn check_for_warning(&mut self) -> Option<SyncStats> {
        if self.accepted_since_eval < EVAL_EVERY {
            return None;
        }
        self.accepted_since_eval = 0;
        let stats = self.compute_stats();
        if !stats.exceeds_threshold() {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = self.last_warning {
            if now.duration_since(last) < WARN_THROTTLE {
                return None;
            }
        }
        self.last_warning = Some(now);
        Some(stats)
    }
}
