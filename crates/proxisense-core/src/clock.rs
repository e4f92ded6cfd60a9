//! Capture timestamps for observations and scan cycles.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock timestamps anchored to the tokio monotonic clock.
///
/// The wall time is read once at construction; later readings add the
/// monotonic time elapsed since then. Timestamps therefore never go
/// backwards, and under a paused test runtime they advance exactly with
/// the virtual clock.
#[derive(Debug, Clone, Copy)]
pub struct SensorClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl SensorClock {
    /// Anchor a clock at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor a clock so that "now" reads as `wall`.
    #[must_use]
    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall: wall,
            origin: Instant::now(),
        }
    }

    /// Current capture time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.origin_wall.checked_add_signed(d))
            .unwrap_or(self.origin_wall)
    }
}

impl Default for SensorClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_virtual_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = SensorClock::anchored_at(start);
        assert_eq!(clock.now(), start);

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(clock.now().timestamp_millis(), start.timestamp_millis() + 2500);
    }
}
