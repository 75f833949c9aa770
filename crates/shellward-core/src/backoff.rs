/// Bounded exponential backoff with jitter, used by cleanup retry loops.
///
/// The base delay doubles (by `multiplier`) after each attempt, capped at
/// `max_delay`. Each returned delay is the base scaled by a random factor
/// in `[0.5, 1.0]` so concurrent retries spread out.
use rand::Rng;
use std::time::Duration;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of delays handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current base delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    /// Like `next_delay`, scaled by a random factor in `[0.5, 1.0]`.
    pub fn next_jittered(&mut self) -> Duration {
        let base = self.next_delay();
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        base.mul_f64(factor)
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
