//! Queue purge policy.
//!
//! When liquid activity outgrows the per-tick budget the queue grows without
//! bound. [`BacklogMonitor`] watches its length after every tick; once it has
//! been growing for longer than the purge time and still holds more than one
//! tick's worth of work, the oldest entries are dropped.

use std::time::{Duration, Instant};

use terra_voxel::LiquidQueue;

#[derive(Debug, Default)]
pub struct BacklogMonitor {
    /// Queue length seen at the end of the previous tick.
    unprocessed: usize,
    /// Start of the current run of growing ticks.
    growing_since: Option<Instant>,
}

impl BacklogMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the queue length at `now` and purges if the backlog has been
    /// growing for longer than `purge_time`. A zero `purge_time` disables
    /// purging. Returns the number of entries dropped.
    pub fn observe(
        &mut self,
        queue: &mut LiquidQueue,
        loop_max: usize,
        purge_time: Duration,
        now: Instant,
    ) -> usize {
        if purge_time.is_zero() {
            return 0;
        }
        let previous = self.unprocessed;
        self.unprocessed = queue.len();
        if self.unprocessed <= previous {
            self.growing_since = None;
        } else if self.growing_since.is_none() {
            self.growing_since = Some(now);
        }

        let Some(since) = self.growing_since else {
            return 0;
        };
        if now.saturating_duration_since(since) <= purge_time || self.unprocessed <= loop_max {
            return 0;
        }
        let dropped = queue.discard_oldest(self.unprocessed - loop_max);
        tracing::info!(
            dropped,
            remaining = queue.len(),
            "Liquid queue kept growing for {purge_time:?}, dropping oldest entries"
        );
        // Assume the engine can keep up from here.
        self.growing_since = None;
        self.unprocessed = queue.len();
        dropped
    }

    /// Whether the queue grew on the last observed tick.
    pub fn is_growing(&self) -> bool {
        self.growing_since.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
