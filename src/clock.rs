use std::fmt;

use time::OffsetDateTime;
use tokio::time::Instant;

/// Source of "now" for expiry checks and timer scheduling.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Wall-clock time captured once, advanced by the tokio clock.
///
/// Timers sleep on the tokio clock while expiry is compared in wall time;
/// anchoring the two keeps them in agreement, including under
/// `tokio::time::pause`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    wall: OffsetDateTime,
    anchor: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wall: OffsetDateTime::now_utc(),
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> OffsetDateTime {
        self.wall + self.anchor.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(600)).await;
        let elapsed = clock.now() - before;
        assert_eq!(elapsed.whole_seconds(), 600);
    }
}
