//! Scheduling clocks and cancellable one-shot timers.
//!
//! All scheduling math runs on a monotonic elapsed-milliseconds clock
//! anchored at process start; only the persisted periodic last-run table
//! uses wall-clock milliseconds.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Pair of clocks used by the scheduler.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Monotonic milliseconds since the clock was created.
    pub fn elapsed_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    /// Wall-clock milliseconds since the Unix epoch.
    pub fn wall_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot timer that posts a message onto the worker channel when it
/// fires. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Arm a timer that sends `message` on `tx` after `delay`.
    pub fn post_after<M: Send + 'static>(
        tx: UnboundedSender<M>,
        delay: Duration,
        message: M,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
        Self { task }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
