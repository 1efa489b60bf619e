//! Absolute deadlines for the timed operations.
//!
//! Timed waits take an absolute [`Deadline`] measured against one of two
//! clocks. Wait loops never trust a single sleep: after every wake they ask
//! the deadline for the time remaining, so spurious wakes and clock steps only
//! shorten or extend the next sleep.

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{PthreadError, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Use CLOCK_REALTIME for timed waits (default).
pub const CLOCK_REALTIME: i32 = 0;
/// Use CLOCK_MONOTONIC for timed waits.
pub const CLOCK_MONOTONIC: i32 = 1;

/// Clock an absolute `timespec` is measured against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    #[default]
    Realtime,
    Monotonic,
}

impl ClockId {
    /// Decode a C clock id; unknown values are `InvalidArgument`.
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            CLOCK_REALTIME => Ok(Self::Realtime),
            CLOCK_MONOTONIC => Ok(Self::Monotonic),
            _ => Err(PthreadError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Realtime => CLOCK_REALTIME,
            Self::Monotonic => CLOCK_MONOTONIC,
        }
    }
}

/// POSIX `struct timespec`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    #[must_use]
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// Returns true if the fields form a valid absolute time.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.tv_sec >= 0 && self.tv_nsec >= 0 && self.tv_nsec < NANOS_PER_SEC
    }

    fn to_duration(self) -> Result<Duration> {
        if !self.is_valid() {
            return Err(PthreadError::InvalidArgument);
        }
        Ok(Duration::new(self.tv_sec as u64, self.tv_nsec as u32))
    }

    /// Current realtime clock value.
    #[must_use]
    pub fn now_realtime() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            tv_sec: since.as_secs() as i64,
            tv_nsec: i64::from(since.subsec_nanos()),
        }
    }

    /// `self + d`, saturating at `i64::MAX` seconds.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let mut sec = self
            .tv_sec
            .saturating_add(i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        let mut nsec = self.tv_nsec + i64::from(d.subsec_nanos());
        if nsec >= NANOS_PER_SEC {
            nsec -= NANOS_PER_SEC;
            sec = sec.saturating_add(1);
        }
        Self {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    }
}

// Monotonic timespecs are taken relative to a process-wide origin.
fn monotonic_origin() -> Instant {
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// An absolute point in time at which a timed operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Monotonic(Instant),
    Realtime(SystemTime),
}

impl Deadline {
    /// Deadline `d` from now on the monotonic clock.
    #[must_use]
    pub fn after(d: Duration) -> Self {
        let now = Instant::now();
        // Unbounded requests clamp to a year out.
        Self::Monotonic(
            now.checked_add(d)
                .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365)),
        )
    }

    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self::Monotonic(instant)
    }

    /// Interpret an absolute `timespec` against `clock`.
    ///
    /// For [`ClockId::Monotonic`] the timespec counts from the process-wide
    /// origin returned by [`Deadline::monotonic_now`].
    pub fn from_timespec(clock: ClockId, ts: Timespec) -> Result<Self> {
        let offset = ts.to_duration()?;
        Ok(match clock {
            ClockId::Realtime => Self::Realtime(
                UNIX_EPOCH
                    .checked_add(offset)
                    .ok_or(PthreadError::InvalidArgument)?,
            ),
            ClockId::Monotonic => Self::Monotonic(
                monotonic_origin()
                    .checked_add(offset)
                    .ok_or(PthreadError::InvalidArgument)?,
            ),
        })
    }

    /// Current value of the monotonic clock in the timespec form accepted by
    /// [`Deadline::from_timespec`].
    #[must_use]
    pub fn monotonic_now() -> Timespec {
        let since = monotonic_origin().elapsed();
        Timespec {
            tv_sec: since.as_secs() as i64,
            tv_nsec: i64::from(since.subsec_nanos()),
        }
    }

    /// Time left before the deadline, or `None` once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let left = match self {
            Self::Monotonic(at) => at.checked_duration_since(Instant::now())?,
            Self::Realtime(at) => at.duration_since(SystemTime::now()).ok()?,
        };
        (!left.is_zero()).then_some(left)
    }

    #[must_use]
    pub fn has_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

/// Block on `cv` until notified or until `deadline`, whichever comes first.
///
/// Returns true once the deadline has passed. Callers loop on their own
/// predicate; a `false` return may be spurious.
pub(crate) fn park<T>(
    cv: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<&Deadline>,
) -> bool {
    match deadline {
        None => {
            cv.wait(guard);
            false
        }
        Some(deadline) => match deadline.remaining() {
            None => true,
            Some(left) => {
                cv.wait_for(guard, left);
                deadline.has_expired()
            }
        },
    }
}
