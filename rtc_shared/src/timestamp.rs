//! Device clock timestamps.
//!
//! A `Timestamp` is whole epoch seconds plus a fraction expressed as `ticks` over a
//! fixed `denominator`. The denominator travels with the value so a timestamp decoded
//! at one scale can never be silently interpreted at another.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::protocol::ProtocolError;

const NANOS_PER_SEC: i128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u64,
    /// Sub-second numerator, always `< denominator`.
    pub ticks: u32,
    /// Ticks per second.
    pub denominator: u32,
}

impl Timestamp {
    pub const MICROS: u32 = 1_000_000;
    pub const CENTIS: u32 = 100;
    pub const NANOS: u32 = 1_000_000_000;

    /// Build a timestamp, rejecting a fraction outside `0..denominator`.
    pub fn new(seconds: u64, ticks: u32, denominator: u32) -> Result<Self, ProtocolError> {
        if denominator == 0 || ticks >= denominator {
            return Err(ProtocolError::FractionOutOfRange { ticks, denominator });
        }
        Ok(Self { seconds, ticks, denominator })
    }

    /// Sample a wall-clock instant at the given scale. The fraction is truncated, not
    /// rounded, so the result never runs ahead of `time`. Instants before the epoch
    /// clamp to zero.
    pub fn from_system_time(time: SystemTime, denominator: u32) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self::from_nanos(i128::from(since_epoch.as_secs()) * NANOS_PER_SEC + i128::from(since_epoch.subsec_nanos()), denominator)
    }

    /// Build from nanoseconds since the epoch; negative values clamp to zero.
    pub fn from_nanos(nanos: i128, denominator: u32) -> Self {
        let denominator = denominator.max(1);
        let nanos = nanos.max(0);
        let seconds = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
        let subsec = nanos % NANOS_PER_SEC;
        let ticks = (subsec * i128::from(denominator) / NANOS_PER_SEC) as u32;
        Self { seconds, ticks, denominator }
    }

    pub fn to_nanos(&self) -> i128 {
        i128::from(self.seconds) * NANOS_PER_SEC + i128::from(self.ticks) * NANOS_PER_SEC / i128::from(self.denominator)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + f64::from(self.ticks) / f64::from(self.denominator)
    }

    /// Signed difference `self - earlier` in seconds.
    ///
    /// Computed on integer nanoseconds first; converting two epoch-scale values to
    /// `f64` before subtracting would lose the microsecond digits.
    pub fn seconds_since(&self, earlier: &Timestamp) -> f64 {
        (self.to_nanos() - earlier.to_nanos()) as f64 / NANOS_PER_SEC as f64
    }

    /// Same instant expressed at another denominator (truncating).
    pub fn rescaled(&self, denominator: u32) -> Self {
        if denominator == self.denominator {
            return *self;
        }
        Self::from_nanos(self.to_nanos(), denominator)
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(u64::try_from(self.to_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Timestamp {
    /// Decimal rendering; exact for power-of-ten denominators.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.denominator.max(1).ilog10() as usize;
        if width == 0 {
            return write!(f, "{}", self.seconds);
        }
        write!(f, "{}.{:0width$}", self.seconds, self.ticks, width = width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_fraction_at_denominator() {
        assert!(Timestamp::new(10, 999_999, Timestamp::MICROS).is_ok());
        assert!(matches!(
            Timestamp::new(10, 1_000_000, Timestamp::MICROS),
            Err(ProtocolError::FractionOutOfRange { ticks: 1_000_000, denominator: 1_000_000 })
        ));
        assert!(Timestamp::new(10, 0, 0).is_err());
    }

    #[test]
    fn test_from_system_time_truncates_fraction() {
        let time = UNIX_EPOCH + Duration::new(1_000_000, 567_890_123);
        let micros = Timestamp::from_system_time(time, Timestamp::MICROS);
        assert_eq!(micros.seconds, 1_000_000);
        assert_eq!(micros.ticks, 567_890);
        let centis = Timestamp::from_system_time(time, Timestamp::CENTIS);
        assert_eq!(centis.ticks, 56);
    }

    #[test]
    fn test_pre_epoch_clamps_to_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(5);
        let ts = Timestamp::from_system_time(before, Timestamp::MICROS);
        assert_eq!((ts.seconds, ts.ticks), (0, 0));
        assert_eq!(Timestamp::from_nanos(-1, Timestamp::MICROS).to_nanos(), 0);
    }

    #[test]
    fn test_seconds_since_keeps_microsecond_precision() {
        let a = Timestamp::new(1_700_000_000, 1, Timestamp::MICROS).unwrap();
        let b = Timestamp::new(1_700_000_000, 0, Timestamp::MICROS).unwrap();
        assert!((a.seconds_since(&b) - 1e-6).abs() < 1e-12);
        assert!((b.seconds_since(&a) + 1e-6).abs() < 1e-12);

        let later = Timestamp::new(1_700_000_002, 250_000, Timestamp::MICROS).unwrap();
        let earlier = Timestamp::new(1_700_000_001, 750_000, Timestamp::MICROS).unwrap();
        assert!((later.seconds_since(&earlier) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rescale_between_denominators() {
        let ts = Timestamp::new(42, 123_456, Timestamp::MICROS).unwrap();
        let centis = ts.rescaled(Timestamp::CENTIS);
        assert_eq!((centis.seconds, centis.ticks, centis.denominator), (42, 12, 100));
        assert_eq!(centis.rescaled(Timestamp::MICROS).ticks, 120_000);
    }

    #[test]
    fn test_display() {
        let ts = Timestamp::new(1_000_000, 500, Timestamp::MICROS).unwrap();
        assert_eq!(ts.to_string(), "1000000.000500");
        let legacy = Timestamp::new(7, 5, Timestamp::CENTIS).unwrap();
        assert_eq!(legacy.to_string(), "7.05");
    }

    #[test]
    fn test_system_time_round_trip() {
        let ts = Timestamp::new(1_000_000, 500_000, Timestamp::MICROS).unwrap();
        let back = Timestamp::from_system_time(ts.to_system_time(), Timestamp::MICROS);
        assert_eq!(ts, back);
    }
}
