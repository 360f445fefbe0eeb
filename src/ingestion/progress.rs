//! Per-file progress tracking (§4.5.3).
//!
//! Tracks an exponential moving average of rows/sec, exposed as a
//! `CurrentFileStatus` the orchestrator copies into the report on every
//! callback. Percentage is capped at 99 until `complete()` runs.

const EMA_ALPHA: f64 = 0.2;
const MIN_ROWS_FOR_ETA: u64 = 10;

use chrono::Utc;

use crate::reporting::CurrentFileStatus;

pub struct ProgressTracker {
    file_name: String,
    total_rows_estimate: u64,
    row_number: u64,
    rows_per_minute_ema: Option<f64>,
    last_tick: std::time::Instant,
}

impl ProgressTracker {
    pub fn new(file_name: impl Into<String>, total_rows_estimate: u64) -> Self {
        ProgressTracker {
            file_name: file_name.into(),
            total_rows_estimate,
            row_number: 0,
            rows_per_minute_ema: None,
            last_tick: std::time::Instant::now(),
        }
    }

    /// Record that `delta` more rows were processed and recompute the EMA.
    /// Call on every progress callback (every 100 rows per §4.5 step 5).
    pub fn advance(&mut self, delta: u64) -> CurrentFileStatus {
        let elapsed = self.last_tick.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);
        self.last_tick = std::time::Instant::now();
        self.row_number += delta;

        let instantaneous_per_minute = (delta as f64 / elapsed) * 60.0;
        self.rows_per_minute_ema = Some(match self.rows_per_minute_ema {
            Some(prev) => EMA_ALPHA * instantaneous_per_minute + (1.0 - EMA_ALPHA) * prev,
            None => instantaneous_per_minute,
        });

        self.status(false)
    }

    /// Force completion: percentage 100, zero remaining, stamped `now`.
    pub fn complete(&mut self) -> CurrentFileStatus {
        self.status(true)
    }

    fn status(&self, done: bool) -> CurrentFileStatus {
        let effective_total = self.total_rows_estimate.max(self.row_number);

        let percentage_completed = if done {
            100
        }
        else if effective_total == 0 {
            0
        }
        else {
            let raw = (self.row_number * 100 / effective_total.max(1)).min(99);
            raw as u8
        };

        let rows_per_minute = self.rows_per_minute_ema.unwrap_or(0.0);

        let (estimated_time_remaining_secs, estimated_completion) = if done {
            (Some(0.0), Some(Utc::now()))
        }
        else if self.row_number < MIN_ROWS_FOR_ETA || rows_per_minute <= 0.0 {
            (None, None)
        }
        else {
            let remaining_rows = effective_total.saturating_sub(self.row_number) as f64;
            let remaining_secs = remaining_rows / (rows_per_minute / 60.0);
            (Some(remaining_secs), Some(Utc::now() + chrono::Duration::milliseconds((remaining_secs * 1000.0) as i64)))
        };

        CurrentFileStatus {
            file_name: self.file_name.clone(),
            total_rows_estimate: self.total_rows_estimate,
            row_number: self.row_number,
            percentage_completed,
            rows_per_minute,
            estimated_time_remaining_secs,
            estimated_completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_capped_at_99_before_completion() {
        let mut tracker = ProgressTracker::new("f.csv", 10);
        let status = tracker.advance(10);
        assert_eq!(status.percentage_completed, 99);
    }

    #[test]
    fn complete_forces_100_percent() {
        let mut tracker = ProgressTracker::new("f.csv", 10);
        tracker.advance(10);
        let status = tracker.complete();
        assert_eq!(status.percentage_completed, 100);
        assert_eq!(status.estimated_time_remaining_secs, Some(0.0));
    }

    #[test]
    fn no_eta_before_minimum_rows() {
        let mut tracker = ProgressTracker::new("f.csv", 1000);
        let status = tracker.advance(5);
        assert!(status.estimated_time_remaining_secs.is_none());
    }

    #[test]
    fn effective_total_grows_past_estimate() {
        let mut tracker = ProgressTracker::new("f.csv", 5);
        let status = tracker.advance(20);
        assert_eq!(status.row_number, 20);
        assert_eq!(status.percentage_completed, 99);
    }
}
