//! Capture timestamps.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Absolute instant of first-byte observation for a message, as nanoseconds
/// since the Unix epoch.
///
/// Monotonically non-decreasing within any single half-flow. Stored on disk
/// verbatim as an `i64`, which is good until 2262.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaptureTime(pub i64);

impl CaptureTime {
    pub const ZERO: CaptureTime = CaptureTime(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        CaptureTime(since_epoch.as_nanos() as i64)
    }

    /// Builds a timestamp from a pcap packet header's `timeval`.
    pub fn from_timeval(tv_sec: i64, tv_usec: i64) -> Self {
        CaptureTime(tv_sec * 1_000_000_000 + tv_usec * 1_000)
    }

    pub const fn from_nanos(ns: i64) -> Self {
        CaptureTime(ns)
    }

    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Nanoseconds elapsed since `earlier`, saturating at zero if `earlier`
    /// is in fact later.
    pub fn since(&self, earlier: CaptureTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl Add<Duration> for CaptureTime {
    type Output = CaptureTime;

    fn add(self, rhs: Duration) -> CaptureTime {
        CaptureTime(self.0.saturating_add(rhs.as_nanos() as i64))
    }
}

impl Sub for CaptureTime {
    type Output = Duration;

    fn sub(self, rhs: CaptureTime) -> Duration {
        self.since(rhs)
    }
}

impl fmt::Display for CaptureTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// Scales a recorded inter-arrival gap by the playback speed factor.
///
/// `speed > 1.0` compresses the gap, `speed < 1.0` stretches it.
pub(crate) fn scale_gap(gap: Duration, speed: f64) -> Duration {
    if speed <= 0.0 {
        return gap;
    }
    Duration::from_nanos((gap.as_nanos() as f64 / speed) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeval_to_nanos() {
        let ts = CaptureTime::from_timeval(1, 250_000);
        assert_eq!(ts.as_nanos(), 1_250_000_000);
    }

    #[test]
    fn since_saturates() {
        let a = CaptureTime(100);
        let b = CaptureTime(400);
        assert_eq!(b.since(a), Duration::from_nanos(300));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn gap_scaling() {
        let gap = Duration::from_millis(100);
        assert_eq!(scale_gap(gap, 2.0), Duration::from_millis(50));
        assert_eq!(scale_gap(gap, 0.5), Duration::from_millis(200));
        assert_eq!(scale_gap(gap, 1.0), gap);
    }
}
