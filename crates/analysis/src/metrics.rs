use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operational counters of one queue processor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorMetrics {
    /// Items that reached a completed status.
    pub items_completed: u64,
    /// Attempts that asked for a retry.
    pub retries: u64,
    pub timeouts: u64,
    /// Parents flipped to done once their sub-items completed.
    pub sub_items_completed: u64,
    pub cleanup_deleted: u64,
    pub passes: u64,
    /// Passes that ended before draining the queue.
    pub incomplete_passes: u64,
    /// Average wall-clock time of an attempt.
    pub avg_item_duration: Duration,
    attempts: u64,
    pub last_pass: Option<DateTime<Utc>>,
}

impl ProcessorMetrics {
    /// Record an attempt and its duration.
    pub fn record_attempt(&mut self, duration: Duration) {
        self.attempts += 1;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_item_duration = if self.attempts == 1 {
            duration
        } else {
            let prev_nanos = self.avg_item_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.attempts as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }

    pub fn record_pass(&mut self, completed: bool) {
        self.passes += 1;
        if !completed {
            self.incomplete_passes += 1;
        }
        self.last_pass = Some(Utc::now());
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}
