//! NTP timestamps carried with every value update.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// 64-bit NTP timestamp: whole seconds plus a 2^-32 fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: u32,
    pub frac: u32,
}

impl Time {
    /// Sentinel meaning "stamp me when sent".
    pub const NOW: Time = Time { sec: 0, frac: 1 };

    pub fn new(sec: u32, frac: u32) -> Self {
        Self { sec, frac }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let sec = (dt.timestamp() + NTP_UNIX_OFFSET) as u32;
        let frac = ((dt.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self { sec, frac: frac as u32 }
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        let sec = seconds.trunc();
        let frac = (seconds - sec) * 4_294_967_296.0;
        Self { sec: sec as u32, frac: frac as u32 }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.frac as f64 / 4_294_967_296.0
    }

    /// Seconds elapsed from `earlier` to `self`, negative if `earlier` is later.
    pub fn since(&self, earlier: Time) -> f64 {
        self.as_secs_f64() - earlier.as_secs_f64()
    }

    pub fn is_now(&self) -> bool {
        *self == Self::NOW
    }

    /// Resolve the `NOW` sentinel to the current clock.
    pub fn resolve(self) -> Self {
        if self.is_now() { Self::now() } else { self }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08x}", self.sec, self.frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_uses_fraction() {
        let a = Time::new(10, 5);
        let b = Time::new(10, 6);
        assert!(a < b);
        assert!(Time::new(11, 0) > b);
    }

    #[test]
    fn test_secs_roundtrip_is_close() {
        let t = Time::from_secs_f64(12.25);
        assert_eq!(t.sec, 12);
        assert!((t.as_secs_f64() - 12.25).abs() < 1e-9);
    }

    #[test]
    fn test_now_is_after_ntp_offset() {
        let now = Time::now();
        assert!(now.sec as i64 > NTP_UNIX_OFFSET);
        assert!(!now.is_now());
    }
}
