//! Exponential backoff.

use std::time::Duration;

/// Doubling delay with an optional ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Backoff starting at `initial` and doubling without limit.
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max: None,
        }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self.current = self.current.min(max);
        self
    }

    /// Current delay; advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.saturating_mul(2);
        self.current = match self.max {
            Some(max) => doubled.min(max),
            None => doubled,
        };
        delay
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.current = match self.max {
            Some(max) => self.initial.min(max),
            None => self.initial,
        };
    }
}
