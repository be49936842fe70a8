//! Progress throttling.
//!
//! The spec's `counters` field is explicitly transient and never
//! required to be durable, but a complete manager still needs a way to
//! avoid flooding listeners on every byte a fetch worker reports. This
//! mirrors the teacher's own `ProgressThrottle`.

use std::time::{Duration, Instant};

/// Rate-limiter for progress updates: at most one emission per
/// `min_interval`, always allowing the first.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// 250ms, matching the teacher's `spawn_progress_bridge` tick.
    #[must_use]
    pub const fn default_interval() -> Self {
        Self::new(Duration::from_millis(250))
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub const fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::default_interval()
    }
}
