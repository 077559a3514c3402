//! Exponential-backoff retry policy (§2.2), ported from
//! `capture/timeout_utils.py`'s `RetryPolicy`/`exponential_backoff`.
//!
//! The Python original also offers a `retry_on_failure` decorator and a
//! `run_with_timeout` helper backed by a `ThreadPoolExecutor`; here that
//! shape becomes [`with_timeout`], a one-shot worker thread joined
//! unconditionally so the calling thread is never leaked, the same
//! "thread is properly cleaned up whether the operation succeeds, fails, or
//! times out" guarantee the Python docstring describes.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(attempt, self.base_delay, self.max_delay)
    }

    /// Run `op`, retrying on `Err` per this policy and sleeping
    /// [`RetryPolicy::delay_for`] between attempts. Returns the last error if
    /// every attempt fails.
    pub fn run<T, E>(&self, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry(attempt) {
                        return Err(err);
                    }
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

pub fn exponential_backoff(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let scaled = base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(max_delay)
}

/// Run `op` on a dedicated worker thread, joined unconditionally whether it
/// finishes within `timeout` or not -- so the calling thread never leaks a
/// detached worker (§4.2 "a timeout wrapper ... must guarantee no thread
/// leaks").
pub fn with_timeout<T, F>(timeout: Duration, op: F) -> Result<T, TimeoutError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = std::thread::spawn(move || {
        let _ = tx.send(op());
    });
    let result = rx.recv_timeout(timeout);
    let _ = handle.join();
    result.map_err(|_| TimeoutError)
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation timed out")]
pub struct TimeoutError;
