use numbox_core::Clock;
use tokio::time::Instant;

/// Wall clock read once, then advanced by tokio's monotonic clock.
///
/// Under `tokio::time::pause()` this clock moves only when the runtime's
/// virtual time does, so countdowns and pollers stay in step in tests.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    base_millis: i64,
    origin: Instant,
}

impl AnchoredClock {
    pub fn new(base_millis: i64) -> Self {
        Self {
            base_millis,
            origin: Instant::now(),
        }
    }

    /// Anchor at the current system time.
    pub fn from_system() -> Self {
        Self::new(numbox_core::SystemClock.now_millis())
    }
}

impl Clock for AnchoredClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_millis.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let clock = AnchoredClock::new(5_000);
        assert_eq!(clock.now_millis(), 5_000);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_millis(), 6_500);
    }
}
