//! Monotonic and wall-clock timestamps used throughout the reactor core.
//!
//! The reactor only ever arms timeouts against the monotonic clock; the wall
//! clock exists solely so log lines carry human-meaningful timestamps.

use std::fmt;
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

/// A timestamp expressed as (seconds, nanoseconds) with a distinguished
/// [`Instant::NEVER`] sentinel that compares greater than every other value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instant {
    secs: u64,
    nsecs: u32,
}

const NEVER_SECS: u64 = u64::MAX;

impl Instant {
    /// A timestamp that never arrives; used to mean "no deadline".
    pub const NEVER: Instant = Instant {
        secs: NEVER_SECS,
        nsecs: 0,
    };

    pub const fn new(secs: u64, nsecs: u32) -> Self {
        if secs >= NEVER_SECS {
            Self::NEVER
        } else {
            Instant { secs, nsecs }
        }
    }

    pub fn is_never(&self) -> bool {
        self.secs == NEVER_SECS
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn nsecs(&self) -> u32 {
        self.nsecs
    }

    /// Saturating addition of a millisecond delta. `NEVER + anything = NEVER`.
    pub fn add_millis(&self, millis: u64) -> Instant {
        if self.is_never() {
            return Instant::NEVER;
        }
        self.add_nanos(millis.saturating_mul(1_000_000))
    }

    /// Saturating addition of a nanosecond delta.
    pub fn add_nanos(&self, nanos: u64) -> Instant {
        if self.is_never() {
            return Instant::NEVER;
        }
        let total_nsecs = self.nsecs as u64 + nanos % 1_000_000_000;
        let carry_secs = nanos / 1_000_000_000 + total_nsecs / 1_000_000_000;
        let secs = self.secs.saturating_add(carry_secs);
        let nsecs = (total_nsecs % 1_000_000_000) as u32;
        Instant::new(secs, nsecs)
    }

    /// Saturating difference; `NEVER - x = NEVER`, and the result never goes
    /// below zero.
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        if self.is_never() {
            return Duration::MAX;
        }
        if other.is_never() || other > *self {
            return Duration::ZERO;
        }
        let secs = self.secs - other.secs;
        if self.nsecs >= other.nsecs {
            Duration::new(secs, self.nsecs - other.nsecs)
        } else {
            Duration::new(secs.saturating_sub(1), 1_000_000_000 + self.nsecs - other.nsecs)
        }
    }

    fn from_timespec(ts: TimeSpec) -> Self {
        Instant::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.secs, self.nsecs).cmp(&(other.secs, other.nsecs))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}.{:09}", self.secs, self.nsecs)
        }
    }
}

/// The two clock sources the core distinguishes: monotonic (used for every
/// timeout computation) and wall-clock (used only for human-readable
/// logging).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic clock backed by `CLOCK_MONOTONIC`. The reactor uses this
/// exclusively for timer-store deadlines.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC must be available");
        Instant::from_timespec(ts)
    }
}

/// Wall-clock timestamp, for logging only; never consulted by timeout math.
pub fn wall_clock_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// In-memory stand-in for [`Clock`], used only under `#[cfg(test)]` where a
/// scenario needs deterministic control over `now()` instead of real wall
/// time.
#[cfg(test)]
pub(crate) struct FakeClock(std::sync::Mutex<Instant>);

#[cfg(test)]
impl FakeClock {
    pub(crate) fn new(start: Instant) -> Self {
        FakeClock(std::sync::Mutex::new(start))
    }

    pub(crate) fn set(&self, instant: Instant) {
        *self.0.lock().unwrap() = instant;
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_satisfies_the_clock_seam() {
        let clock: Box<dyn Clock> = Box::new(FakeClock::new(Instant::new(10, 0)));
        assert_eq!(clock.now(), Instant::new(10, 0));
    }

    #[test]
    fn fake_clock_set_advances_now() {
        let fake = FakeClock::new(Instant::new(1, 0));
        assert_eq!(fake.now(), Instant::new(1, 0));
        fake.set(Instant::new(5, 0));
        assert_eq!(fake.now(), Instant::new(5, 0));
    }

    #[test]
    fn never_is_greatest() {
        let a = Instant::new(10, 0);
        assert!(Instant::NEVER > a);
        assert!(a < Instant::NEVER);
    }

    #[test]
    fn add_millis_carries_seconds() {
        let a = Instant::new(1, 900_000_000);
        let b = a.add_millis(200);
        assert_eq!(b, Instant::new(2, 100_000_000));
    }

    #[test]
    fn add_saturates_on_never() {
        assert_eq!(Instant::NEVER.add_millis(50), Instant::NEVER);
    }

    #[test]
    fn saturating_sub_never_goes_negative() {
        let a = Instant::new(5, 0);
        let b = Instant::new(10, 0);
        assert_eq!(a.saturating_sub(b), Duration::ZERO);
    }

    #[test]
    fn saturating_sub_never_minuend_is_max() {
        assert_eq!(Instant::NEVER.saturating_sub(Instant::new(1, 0)), Duration::MAX);
    }

    #[test]
    fn ordering_total() {
        let mut v = vec![Instant::NEVER, Instant::new(1, 0), Instant::new(0, 500)];
        v.sort();
        assert_eq!(v[0], Instant::new(0, 500));
        assert_eq!(v[2], Instant::NEVER);
    }
}
