use crate::error::{Error, Result};
use derive_more::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MICROS_PER_SEC: i64 = 1_000_000;

/// A wall-clock instant with microsecond resolution.
///
/// The value is held as a `(seconds, microseconds)` pair with the
/// microsecond component normalized into `[0, 1_000_000)`, so ordering is a
/// plain lexicographic comparison and subtraction is exact in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    secs: i64,
    micros: i32,
}

impl Timestamp {
    /// Create a `Timestamp`, normalizing the microsecond component.
    #[must_use]
    pub fn new(secs: i64, micros: i64) -> Self {
        let total = secs * MICROS_PER_SEC + micros;
        Self {
            secs: total.div_euclid(MICROS_PER_SEC),
            micros: total.rem_euclid(MICROS_PER_SEC) as i32,
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Result<Self> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::ClockUnavailable)?;
        let secs = i64::try_from(elapsed.as_secs()).map_err(|_| Error::ClockUnavailable)?;
        Ok(Self::new(secs, i64::from(elapsed.subsec_micros())))
    }

    /// The whole seconds component.
    #[must_use]
    pub const fn seconds(self) -> i64 {
        self.secs
    }

    /// The microseconds component, always in `[0, 1_000_000)`.
    #[must_use]
    pub const fn microseconds(self) -> i32 {
        self.micros
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let secs = self.secs.saturating_add_unsigned(rhs.as_secs());
        Self::new(secs, i64::from(self.micros) + i64::from(rhs.subsec_micros()))
    }
}

impl std::ops::Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Self) -> TimeDelta {
        TimeDelta((self.secs - rhs.secs) * MICROS_PER_SEC + i64::from(self.micros - rhs.micros))
    }
}

/// A signed span between two [`Timestamp`]s, in microseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Add, Sub, AddAssign,
)]
pub struct TimeDelta(pub i64);

impl TimeDelta {
    /// The span in microseconds.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns true if the span is negative, i.e. the deadline it was
    /// computed against has already passed.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// The span as a `Duration`, clamped to zero if negative.
    #[must_use]
    pub fn to_duration(self) -> Duration {
        u64::try_from(self.0).map_or(Duration::ZERO, Duration::from_micros)
    }
}
