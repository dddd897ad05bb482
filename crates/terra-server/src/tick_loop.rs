//! Fixed-timestep world loop.
//!
//! World updates run at a fixed rate no matter how long one pass of the outer
//! loop takes. Time is banked in an accumulator and spent in whole ticks; a
//! stalled pass is clamped so the world slows down instead of trying to catch
//! up with hundreds of ticks at once.

use std::time::{Duration, Instant};

use tracing::warn;

/// Tick rate used when the configured one is zero.
pub const DEFAULT_TICK_RATE_HZ: u32 = 20;

/// Longest stretch of wall-clock time a single pass may account for.
pub const MAX_FRAME_TIME: f64 = 0.25;

/// Fixed-timestep loop state.
///
/// Call [`tick`](Self::tick) once per pass of the server loop; it runs zero or
/// more world steps of exactly [`dt`](Self::dt) seconds.
pub struct TickLoop {
    dt: f64,
    previous_time: Instant,
    accumulator: f64,
    total_sim_time: f64,
    update_count: u64,
}

impl TickLoop {
    pub fn new(rate_hz: u32) -> Self {
        let rate = if rate_hz == 0 {
            DEFAULT_TICK_RATE_HZ
        } else {
            rate_hz
        };
        Self {
            dt: 1.0 / f64::from(rate),
            previous_time: Instant::now(),
            accumulator: 0.0,
            total_sim_time: 0.0,
            update_count: 0,
        }
    }

    /// Length of one world step in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Measures the time since the previous call and runs the steps it covers.
    ///
    /// `update_fn(dt, total_sim_time)` is called once per step. Returns the
    /// number of steps run.
    pub fn tick(&mut self, update_fn: impl FnMut(f64, f64)) -> u32 {
        let current_time = Instant::now();
        let frame_time = current_time
            .duration_since(self.previous_time)
            .as_secs_f64();
        self.previous_time = current_time;
        self.advance(frame_time, update_fn)
    }

    /// Runs the steps covered by `frame_time` seconds of elapsed time.
    pub fn advance(&mut self, frame_time: f64, mut update_fn: impl FnMut(f64, f64)) -> u32 {
        let mut frame_time = frame_time.max(0.0);
        if frame_time > MAX_FRAME_TIME {
            warn!(
                "World fell behind by {:.1}ms, clamping to {:.1}ms",
                frame_time * 1000.0,
                MAX_FRAME_TIME * 1000.0
            );
            frame_time = MAX_FRAME_TIME;
        }

        self.accumulator += frame_time;

        let mut steps = 0;
        while self.accumulator >= self.dt {
            update_fn(self.dt, self.total_sim_time);
            self.total_sim_time += self.dt;
            self.accumulator -= self.dt;
            self.update_count += 1;
            steps += 1;
        }
        steps
    }

    /// How long the server can sleep before the next step is due.
    pub fn time_to_next_step(&self) -> Duration {
        Duration::from_secs_f64((self.dt - self.accumulator).max(0.0))
    }

    /// Total number of world steps executed.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Total simulated time in seconds.
    pub fn total_sim_time(&self) -> f64 {
        self.total_sim_time
    }
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_RATE_HZ)
    }
}
