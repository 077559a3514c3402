//! Capture service (C3, §4.2).
//!
//! One native thread per camera, grounded in `ci2-async::ThreadedAsyncCamera`'s
//! "spawn a thread, loop `next_frame` while a liveness flag holds" shape --
//! simplified here to a plain `AtomicBool` per §5's thread inventory ("a
//! `running` flag (`AtomicBool`) is polled by every loop"), since this crate
//! is synchronous-threads-only, not `futures::Stream`-based like the teacher.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::collaborators::{CameraDevice, CameraControls, CameraMode, ReadOutcome};
use crate::error::{Error, ErrorCategory, ErrorSeverity};
use crate::event_bus::EventBus;
use crate::events::{ErrorEvent, FrameCaptured};
use crate::retry::RetryPolicy;
use crate::types::CameraId;

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub mode: CameraMode,
    pub controls: CameraControls,
    pub open_timeout: Duration,
    pub open_retry: RetryPolicy,
    pub read_timeout_ms: u32,
    pub consecutive_error_threshold: u32,
    pub stop_join_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CameraMode::default(),
            controls: CameraControls::default(),
            open_timeout: Duration::from_secs(5),
            open_retry: RetryPolicy::default(),
            read_timeout_ms: 200,
            consecutive_error_threshold: 10,
            stop_join_timeout: Duration::from_secs(1),
        }
    }
}

struct CameraHandle {
    camera_id: CameraId,
    running: Arc<AtomicBool>,
    done_rx: crossbeam_channel::Receiver<()>,
    join_handle: std::thread::JoinHandle<()>,
}

/// Per-camera "latest frame" slot, held briefly under lock (§3 "Ownership",
/// §5 "Shared-resource policy").
#[derive(Clone)]
struct LatestFrameSlot(Arc<Mutex<Option<crate::types::Frame>>>);

impl LatestFrameSlot {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn set(&self, frame: crate::types::Frame) {
        *self.0.lock() = Some(frame);
    }

    fn get(&self) -> Option<crate::types::Frame> {
        self.0.lock().clone()
    }
}

pub struct CaptureService {
    bus: EventBus,
    latest: [LatestFrameSlot; 2],
    handles: Mutex<Vec<CameraHandle>>,
}

impl CaptureService {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            latest: [LatestFrameSlot::new(), LatestFrameSlot::new()],
            handles: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, camera_id: CameraId) -> &LatestFrameSlot {
        match camera_id {
            CameraId::Left => &self.latest[0],
            CameraId::Right => &self.latest[1],
        }
    }

    /// Open both cameras (with retry + timeout) and spawn one capture thread
    /// each. Returns once both have opened successfully; a camera that
    /// cannot be opened after retries is reported via an `Error` event and
    /// excluded from the returned running set (§4.2 "Configuration error,
    /// persistent read failure: ... capture for that camera stops").
    pub fn start(
        &self,
        cameras: Vec<(CameraId, Box<dyn CameraDevice>)>,
        config: CaptureConfig,
    ) -> crate::error::Result<()> {
        if !self.handles.lock().is_empty() {
            return Err(Error::Protocol {
                message: "capture already running".to_string(),
            });
        }

        let mut handles = Vec::new();
        for (camera_id, mut device) in cameras {
            let mut attempt = 0;
            let mut current = device;
            let device = loop {
                let (returned, result) = open_with_timeout(current, camera_id, config.open_timeout);
                match result {
                    Ok(()) => break Some(returned),
                    Err(message) => {
                        if !config.open_retry.should_retry(attempt) {
                            self.bus.publish(ErrorEvent::new(
                                "capture",
                                &Error::CameraOpen { camera_id, message },
                            ));
                            break None;
                        }
                        std::thread::sleep(config.open_retry.delay_for(attempt));
                        attempt += 1;
                        current = returned;
                    }
                }
            };

            let mut device = match device {
                Some(device) => device,
                None => continue,
            };

            if let Err(e) = device.set_mode(config.mode) {
                self.bus.publish(ErrorEvent::new("capture", &e));
                continue;
            }
            if let Err(e) = device.set_controls(config.controls) {
                self.bus.publish(ErrorEvent::new("capture", &e));
                continue;
            }

            let running = Arc::new(AtomicBool::new(true));
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let bus = self.bus.clone();
            let slot = self.slot(camera_id).clone();
            let running_thread = running.clone();
            let read_timeout_ms = config.read_timeout_ms;
            let error_threshold = config.consecutive_error_threshold;

            let join_handle = std::thread::Builder::new()
                .name(format!("capture-{}", camera_id.as_str()))
                .spawn(move || {
                    capture_loop(
                        camera_id,
                        device.as_mut(),
                        bus,
                        slot,
                        running_thread,
                        read_timeout_ms,
                        error_threshold,
                    );
                    let _ = done_tx.send(());
                })
                .expect("spawn capture thread");

            handles.push(CameraHandle {
                camera_id,
                running,
                done_rx,
                join_handle,
            });
        }

        *self.handles.lock() = handles;
        Ok(())
    }

    /// Signal all capture threads to stop, join with a timeout, logging (not
    /// failing) on overrun. Idempotent: calling `stop` with no running
    /// threads is a no-op (§8 "stop_capture after stop_capture is a no-op").
    pub fn stop(&self, config: &CaptureConfig) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.running.store(false, Ordering::SeqCst);
            match handle.done_rx.recv_timeout(config.stop_join_timeout) {
                Ok(()) => {}
                Err(_) => {
                    tracing::warn!(
                        camera_id = handle.camera_id.as_str(),
                        "capture thread did not stop within timeout"
                    );
                }
            }
            let _ = handle.join_handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Latest frame from each camera, without blocking (§4.2
    /// `get_preview_frames`).
    pub fn get_preview_frames(&self) -> Vec<(CameraId, Option<crate::types::Frame>)> {
        vec![
            (CameraId::Left, self.latest[0].get()),
            (CameraId::Right, self.latest[1].get()),
        ]
    }
}

/// Run `device.open(camera_id)` on a dedicated worker thread. Always returns
/// the device back to the caller -- on a fast response the channel recv
/// yields it directly; on timeout we keep waiting (with no deadline) so the
/// worker thread is always eventually joined rather than abandoned, per
/// §4.2's "never an unjoined detached thread."
fn open_with_timeout(
    mut device: Box<dyn CameraDevice>,
    camera_id: CameraId,
    timeout: Duration,
) -> (Box<dyn CameraDevice>, Result<(), String>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = std::thread::spawn(move || {
        let result = device.open(camera_id).map_err(|e| e.to_string());
        let _ = tx.send((device, result));
    });

    let outcome = match rx.recv_timeout(timeout) {
        Ok((device, result)) => (device, result),
        Err(_) => match rx.recv() {
            Ok((device, result)) => (
                device,
                result.and(Err("open timed out".to_string())),
            ),
            Err(_) => {
                // Sender dropped without sending: the thread panicked before
                // it could report the device back. Nothing to return.
                let _ = handle.join();
                panic!("camera open worker thread died without reporting a result");
            }
        },
    };
    let _ = handle.join();
    outcome
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    camera_id: CameraId,
    device: &mut dyn CameraDevice,
    bus: EventBus,
    slot: LatestFrameSlot,
    running: Arc<AtomicBool>,
    read_timeout_ms: u32,
    error_threshold: u32,
) {
    let consecutive_errors = AtomicU32::new(0);
    let mut frame_index: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match device.read_frame(read_timeout_ms) {
            Ok(ReadOutcome::Timeout) => continue,
            Ok(ReadOutcome::Frame(mut frame)) => {
                if !frame.is_valid() {
                    consecutive_errors.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                consecutive_errors.store(0, Ordering::SeqCst);
                frame.frame_index = frame_index;
                frame_index += 1;
                slot.set(frame.clone());
                bus.publish(FrameCaptured {
                    camera_id,
                    t_ns: frame.t_capture_ns,
                    frame,
                });
            }
            Err(e) => {
                let errors = consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                if errors >= error_threshold {
                    bus.publish(ErrorEvent {
                        source: "capture".to_string(),
                        category: ErrorCategory::TransientIo,
                        severity: ErrorSeverity::Critical,
                        message: format!(
                            "{} consecutive read failures on camera {:?}: {e}",
                            errors, camera_id
                        ),
                        details: None,
                    });
                }
            }
        }
    }

    device.close();
}
