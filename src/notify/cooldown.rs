use std::time::{Duration, Instant};

/// Default minimum spacing between alert hand-offs.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Throttle for alert hand-offs.
///
/// A dispatch is allowed when strictly more than `window` has elapsed since
/// the last accepted hand-off. Only `mark` moves the window; a rejected
/// hand-off leaves it untouched so the next violation retries.
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    last_handoff: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_handoff: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn ready(&self, now: Instant) -> bool {
        match self.last_handoff {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.window,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_handoff = Some(now);
    }
}

impl Default for Cooldown {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
