//! Detection pool (C4, §4.3).
//!
//! Subscribes to `FrameCaptured`, enqueues onto a per-camera bounded
//! drop-oldest [`RingBuffer`], and runs the detector on worker threads. Two
//! threading modes per §4.3: one dedicated worker per camera, or a shared
//! pool of N workers that round-robins both queues while keeping at most one
//! in-flight detection per camera (to preserve per-camera ordering).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::collaborators::Detector;
use crate::error::{ErrorCategory, ErrorSeverity};
use crate::event_bus::EventBus;
use crate::events::{ErrorEvent, FrameCaptured};
use crate::ring_buffer::RingBuffer;
use crate::types::{CameraId, Detection, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ThreadingMode {
    PerCamera,
    SharedPool { workers: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionPoolConfig {
    pub queue_capacity: usize,
    pub mode: ThreadingMode,
    pub error_log_throttle: Duration,
    pub error_threshold: u32,
}

impl Default for DetectionPoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 6,
            mode: ThreadingMode::PerCamera,
            error_log_throttle: Duration::from_secs(5),
            error_threshold: 10,
        }
    }
}

/// `(camera_id, frame, detections)` -- the pool's published result record
/// (§4.3 "Contract").
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub camera_id: CameraId,
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// Event wrapper so `DetectionResult` can travel through the bus. Kept here
/// rather than in `events.rs` since it is an internal C4->C5 handoff, not
/// part of the core data model in §3.
#[derive(Debug, Clone)]
pub struct DetectionPublished(pub DetectionResult);

struct CameraQueue {
    buffer: Mutex<RingBuffer<Frame>>,
    not_empty: Condvar,
    busy: AtomicBool,
    consecutive_errors: AtomicU32,
}

impl CameraQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(capacity)),
            not_empty: Condvar::new(),
            busy: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    fn push(&self, frame: Frame) {
        let mut buf = self.buffer.lock();
        buf.push_drop_oldest(frame);
        self.not_empty.notify_one();
    }

    fn try_pop(&self) -> Option<Frame> {
        self.buffer.lock().pop_front()
    }
}

fn camera_index(id: CameraId) -> usize {
    match id {
        CameraId::Left => 0,
        CameraId::Right => 1,
    }
}

/// Thread-safe handle; cloning shares state, same shape as
/// [`crate::event_bus::EventBus`].
pub struct DetectionPool {
    bus: EventBus,
    queues: [Arc<CameraQueue>; 2],
    running: Arc<AtomicBool>,
    subscription: Mutex<Option<crate::event_bus::SubscriptionId>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl DetectionPool {
    pub fn new(bus: EventBus, config: DetectionPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            bus,
            queues: [
                Arc::new(CameraQueue::new(config.queue_capacity)),
                Arc::new(CameraQueue::new(config.queue_capacity)),
            ],
            running: Arc::new(AtomicBool::new(true)),
            subscription: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&pool);
        let sub = pool.bus.subscribe::<FrameCaptured, _>(move |event: &FrameCaptured| {
            if let Some(pool) = weak.upgrade() {
                pool.queues[camera_index(event.camera_id)].push(event.frame.clone());
            }
        });
        *pool.subscription.lock() = Some(sub);

        pool
    }

    /// Spawn worker threads per `mode` and run `detector_factory()` once per
    /// worker to build its (non-`Sync`) detector instance.
    pub fn start_workers(
        self: &Arc<Self>,
        mode: ThreadingMode,
        error_threshold: u32,
        mut detector_factory: impl FnMut() -> Box<dyn Detector>,
    ) {
        let mut workers = Vec::new();
        match mode {
            ThreadingMode::PerCamera => {
                for camera_id in [CameraId::Left, CameraId::Right] {
                    let pool = self.clone();
                    let mut detector = detector_factory();
                    workers.push(
                        std::thread::Builder::new()
                            .name(format!("detect-{}", camera_id.as_str()))
                            .spawn(move || {
                                per_camera_worker(pool, camera_id, detector.as_mut(), error_threshold)
                            })
                            .expect("spawn detection worker"),
                    );
                }
            }
            ThreadingMode::SharedPool { workers: n } => {
                for i in 0..n {
                    let pool = self.clone();
                    let mut detector = detector_factory();
                    workers.push(
                        std::thread::Builder::new()
                            .name(format!("detect-pool-{i}"))
                            .spawn(move || shared_pool_worker(pool, detector.as_mut(), error_threshold))
                            .expect("spawn detection worker"),
                    );
                }
            }
        }
        *self.workers.lock() = workers;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for q in &self.queues {
            q.not_empty.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            let _ = w.join();
        }
        if let Some(sub) = self.subscription.lock().take() {
            self.bus.unsubscribe::<FrameCaptured>(sub);
        }
    }
}

fn run_detection(
    pool: &DetectionPool,
    camera_id: CameraId,
    frame: Frame,
    detector: &mut dyn Detector,
    error_threshold: u32,
) {
    let queue = &pool.queues[camera_index(camera_id)];
    match detector.detect(&frame) {
        Ok(detections) => {
            queue.consecutive_errors.store(0, Ordering::SeqCst);
            pool.bus.publish(DetectionPublished(DetectionResult {
                camera_id,
                frame,
                detections,
            }));
        }
        Err(e) => {
            let errors = queue.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(camera_id = camera_id.as_str(), error = %e, "detector failed");
            if errors >= error_threshold {
                pool.bus.publish(ErrorEvent {
                    source: "detection_pool".to_string(),
                    category: ErrorCategory::Detector,
                    severity: ErrorSeverity::Critical,
                    message: format!(
                        "{errors} consecutive detector failures on camera {camera_id:?}: {e}"
                    ),
                    details: None,
                });
            }
        }
    }
}

fn per_camera_worker(
    pool: Arc<DetectionPool>,
    camera_id: CameraId,
    detector: &mut dyn Detector,
    error_threshold: u32,
) {
    let queue = pool.queues[camera_index(camera_id)].clone();
    while pool.running.load(Ordering::SeqCst) {
        let frame = {
            let mut buf = queue.buffer.lock();
            if buf.is_empty() {
                queue.not_empty.wait_for(&mut buf, Duration::from_millis(100));
            }
            buf.pop_front()
        };
        if let Some(frame) = frame {
            run_detection(&pool, camera_id, frame, detector, error_threshold);
        }
    }
}

fn shared_pool_worker(pool: Arc<DetectionPool>, detector: &mut dyn Detector, error_threshold: u32) {
    while pool.running.load(Ordering::SeqCst) {
        let mut made_progress = false;
        for camera_id in [CameraId::Left, CameraId::Right] {
            let queue = pool.queues[camera_index(camera_id)].clone();
            if queue.busy.swap(true, Ordering::SeqCst) {
                continue;
            }
            if let Some(frame) = queue.try_pop() {
                made_progress = true;
                run_detection(&pool, camera_id, frame, detector, error_threshold);
            }
            queue.busy.store(false, Ordering::SeqCst);
        }
        if !made_progress {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
