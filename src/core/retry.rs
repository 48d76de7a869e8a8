//! Retry controller: eligibility, state reset and the back-off policy.
//!
//! Retries are explicit operator actions only. Nothing here schedules a
//! retry on its own; the back-off policy is used by the recovery service and
//! the event-stream reconnect loop.

use std::time::Duration;

use chrono::Utc;
use trackhaul_core::models::task::{DownloadTask, TaskStatus};

use crate::core::queue::QueueError;

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

pub fn ensure_retryable(task: &DownloadTask) -> Result<(), QueueError> {
    if task.can_retry && task.status.is_retryable() {
        Ok(())
    } else {
        Err(QueueError::NotRetryable {
            id: task.id,
            status: task.status,
        })
    }
}

/// Puts a failed or cancelled task back in the queue. `queue_seq` moves it to
/// the back of the admission order.
pub fn reset_for_retry(task: &mut DownloadTask, queue_seq: u64) {
    task.status = TaskStatus::Queued;
    task.progress = 0.0;
    task.error = None;
    task.stage = None;
    task.message = None;
    task.downloaded_bytes = None;
    task.started_at = Some(Utc::now());
    task.ended_at = None;
    task.retry_count += 1;
    task.can_cancel = true;
    task.can_retry = false;
    task.cancel_confirmed = false;
    task.queue_position = None;
    task.queue_seq = queue_seq;
}

/// Exponential back-off with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            (rand::random::<f64>() * 2.0 - 1.0) * jitter_range
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
