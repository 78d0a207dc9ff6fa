//! Fixed-step accumulator driving a room's simulation.

/// Accumulates wall time and hands out whole simulation steps.
#[derive(Debug, Clone)]
pub struct FixedStep {
    step_ms: f64,
    max_frame_ms: f64,
    accumulator: f64,
    last_wake: f64,
}

impl FixedStep {
    pub fn new(step_ms: f64, max_frame_ms: f64, now: f64) -> Self {
        Self {
            step_ms,
            max_frame_ms,
            accumulator: 0.0,
            last_wake: now,
        }
    }

    pub fn step_ms(&self) -> f64 {
        self.step_ms
    }

    /// Accounts for the time since the previous wake-up and returns how many
    /// whole steps are now due. Elapsed time is clamped to `[0, max_frame_ms]`
    /// so a long stall cannot snowball into an unbounded catch-up burst.
    pub fn advance(&mut self, now: f64) -> u32 {
        let elapsed = (now - self.last_wake).clamp(0.0, self.max_frame_ms);
        self.last_wake = now;
        self.accumulator += elapsed;

        let mut steps = 0;
        while self.accumulator >= self.step_ms {
            self.accumulator -= self.step_ms;
            steps += 1;
        }
        steps
    }

    /// Milliseconds until the next step is due, never less than 1.
    pub fn next_wake_in(&self) -> f64 {
        (self.step_ms - self.accumulator).floor().max(1.0)
    }
}
