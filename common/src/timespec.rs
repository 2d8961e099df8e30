use core::{
    fmt,
    ops::{Add, AddAssign},
    time::Duration,
};

const NANOS_PER_SEC: u32 = 1_000_000_000;
const NANOS_PER_MILLI: u32 = 1_000_000;

/// Point on (or span of) the scheduler clock: whole seconds plus a
/// normalized sub-second remainder in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSpec {
    secs: u64,
    nanos: u32,
}

impl TimeSpec {
    pub const ZERO: Self = Self { secs: 0, nanos: 0 };

    pub const fn new(secs: u64, nanos: u32) -> Self {
        let carry = (nanos / NANOS_PER_SEC) as u64;
        Self {
            secs: secs.saturating_add(carry),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            secs: millis / 1_000,
            nanos: (millis % 1_000) as u32 * NANOS_PER_MILLI,
        }
    }

    pub const fn secs(&self) -> u64 {
        self.secs
    }

    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    pub const fn as_millis(&self) -> u128 {
        self.secs as u128 * 1_000 + (self.nanos / NANOS_PER_MILLI) as u128
    }

    pub const fn as_nanos(&self) -> u128 {
        self.secs as u128 * NANOS_PER_SEC as u128 + self.nanos as u128
    }

    /// Advances by a raw millisecond delta read from the hardware counter.
    pub fn add_millis(&mut self, millis: u32) {
        *self += Self::from_millis(millis as u64);
    }

    /// Next due time for a registration that was due at `self` and has
    /// just run at `now`.
    ///
    /// Returns `self` unchanged when it is still in the future. Otherwise
    /// the result is the smallest `self + k * period` strictly after `now`,
    /// so a schedule that fell several periods behind resynchronizes in one
    /// step instead of replaying the missed periods.
    pub fn next_due_after(self, now: Self, period: Self) -> Self {
        if self > now {
            return self;
        }
        let period_nanos = period.as_nanos();
        if period_nanos == 0 {
            return self;
        }
        let behind = now.as_nanos() - self.as_nanos();
        let steps = behind / period_nanos + 1;
        Self::from_nanos(self.as_nanos().saturating_add(steps * period_nanos))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_sub(self, earlier: Self) -> Self {
        Self::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }

    fn from_nanos(nanos: u128) -> Self {
        let secs = nanos / NANOS_PER_SEC as u128;
        if secs > u64::MAX as u128 {
            return Self {
                secs: u64::MAX,
                nanos: NANOS_PER_SEC - 1,
            };
        }
        Self {
            secs: secs as u64,
            nanos: (nanos % NANOS_PER_SEC as u128) as u32,
        }
    }
}

impl Add for TimeSpec {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let nanos = self.nanos + rhs.nanos;
        let carry = (nanos / NANOS_PER_SEC) as u64;
        match self
            .secs
            .checked_add(rhs.secs)
            .and_then(|secs| secs.checked_add(carry))
        {
            Some(secs) => Self {
                secs,
                nanos: nanos % NANOS_PER_SEC,
            },
            None => Self {
                secs: u64::MAX,
                nanos: NANOS_PER_SEC - 1,
            },
        }
    }
}

impl AddAssign for TimeSpec {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl From<Duration> for TimeSpec {
    fn from(duration: Duration) -> Self {
        Self::new(duration.as_secs(), duration.subsec_nanos())
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}
