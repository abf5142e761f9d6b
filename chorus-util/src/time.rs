use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;

/// Conversions for staleness and TTL checks
pub struct TimeUtils;

impl TimeUtils {
    /// Convert a std duration into a chrono duration, saturating on overflow
    pub fn to_chrono(duration: std::time::Duration) -> Duration {
        Duration::from_std(duration).unwrap_or(Duration::MAX)
    }

    /// True when `timestamp` lies more than `threshold` before `now`
    pub fn is_older_than(
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> bool {
        now.signed_duration_since(timestamp) > Self::to_chrono(threshold)
    }
}

/// Source of wall-clock time for heartbeats, staleness checks and TTLs.
///
/// Stores take a clock instead of calling `Utc::now()` directly so that
/// tests running on paused tokio time see heartbeats age.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock driven by the tokio timer.
///
/// Captures a wall-clock anchor at construction and advances it by however
/// much `tokio::time::Instant` has moved since, so `tokio::time::pause()`
/// and `advance()` move it too.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            instant_anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.instant_anchor);
        self.wall_anchor + TimeUtils::to_chrono(elapsed)
    }
}
