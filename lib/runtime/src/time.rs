use core::ops::{Add, AddAssign, Mul, Sub};

/// Simulator time duration.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Duration(u64);

impl core::fmt::Debug for Duration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:03}ns", self.0 / 1000, self.0 % 1000)
    }
}

impl Duration {
    pub const ZERO: Self = Self(0);

    pub const fn from_picos(v: u64) -> Self {
        Self(v)
    }

    pub const fn from_nanos(v: u64) -> Self {
        Self(v * 1000)
    }

    pub const fn as_picos(&self) -> u64 {
        self.0
    }

    /// Number of whole `period`s that fit in this duration.
    pub const fn in_cycles(&self, period: Duration) -> u64 {
        self.0 / period.0
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Self::Output {
        Self(self.0 * rhs as u64)
    }
}

impl Mul<u64> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

/// Simulator time instant.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Instant(u64);

impl core::fmt::Debug for Instant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self == Self::ETERNITY {
            write!(f, "eternity")
        } else {
            Duration(self.0).fmt(f)
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Self::Output {
        assert!(self.0 >= rhs.0);
        Duration(self.0 - rhs.0)
    }
}

impl Instant {
    /// Very first instant of the simulated system.
    ///
    /// Components that need kick-starting should use this instant to perform initialization.
    pub const INIT: Self = Self(0);

    /// The very last instant that can be tracked by the system.
    ///
    /// Effectively means "never".
    pub const ETERNITY: Self = Self(u64::MAX);

    pub const fn as_picos(&self) -> u64 {
        self.0
    }

    pub const fn to_secs(&self) -> f64 {
        self.0 as f64 / (1_000_000_000_000_u64 as f64)
    }
}

pub trait Deadline {
    fn to_instant(self, now: Instant) -> Instant;
}

impl Deadline for Duration {
    fn to_instant(self, now: Instant) -> Instant {
        now + self
    }
}

impl Deadline for Instant {
    fn to_instant(self, _now: Instant) -> Instant {
        self
    }
}

#[test]
fn test_duration_fmt() {
    assert_eq!(format!("{:?}", Duration::from_picos(1500)), "1.500ns");
    assert_eq!(format!("{:?}", Instant::ETERNITY), "eternity");
    assert_eq!(Duration::from_nanos(10).in_cycles(Duration::from_nanos(1)), 10);
}

#[test]
fn test_deadline() {
    let now = Instant::INIT + Duration::from_nanos(3);
    assert_eq!(Duration::from_nanos(2).to_instant(now), Instant::INIT + Duration::from_nanos(5));
    assert_eq!(now.to_instant(Instant::ETERNITY), now);
    assert_eq!(Instant::ETERNITY + Duration::from_nanos(1), Instant::ETERNITY);
}
