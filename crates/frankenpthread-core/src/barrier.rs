//! POSIX barriers.
//!
//! `total` counts arrivals in the current round. The arrival that completes
//! the round adds `ROUND_FLAG - 1`, which both releases the waiters and keeps
//! the next round's arrivals parked until every released waiter has counted
//! itself back out. The last one out brings `total` to exactly `ROUND_FLAG`
//! and wakes them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::attr::ProcessShared;
use crate::cond::Cond;
use crate::error::{PthreadError, Result};
use crate::handle::{HandleRef, NULL_HANDLE, Registry, Validity};
use crate::mutex::{Mutex, MutexKind};
use crate::trace::{self, ObjectKind};

/// Value returned to exactly one waiter per round.
pub const PTHREAD_BARRIER_SERIAL_THREAD: i32 = -1;

const ROUND_FLAG: u32 = 1 << 30;

/// Result of [`Barrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierWait {
    /// This waiter completed the round.
    Serial,
    Released,
}

impl BarrierWait {
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial)
    }

    /// `PTHREAD_BARRIER_SERIAL_THREAD` or 0.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Serial => PTHREAD_BARRIER_SERIAL_THREAD,
            Self::Released => 0,
        }
    }
}

/// `pthread_barrierattr_t`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierAttr {
    pshared: ProcessShared,
}

impl BarrierAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pshared(&mut self, pshared: ProcessShared) {
        self.pshared = pshared;
    }

    #[must_use]
    pub fn pshared(&self) -> ProcessShared {
        self.pshared
    }
}

pub(crate) struct BarrierShared {
    count: u32,
    total: AtomicU32,
    inside: AtomicU32,
    m: Mutex,
    c: Cond,
}

static BARRIERS: Registry<BarrierShared> = Registry::new(ObjectKind::Barrier);

impl BarrierShared {
    fn new(count: u32) -> Result<Self> {
        if count == 0 || count >= ROUND_FLAG {
            return Err(PthreadError::InvalidArgument);
        }
        Ok(Self {
            count,
            total: AtomicU32::new(0),
            inside: AtomicU32::new(0),
            m: Mutex::init(MutexKind::ErrorCheck)?,
            c: Cond::init()?,
        })
    }

    fn is_idle(&self) -> bool {
        self.inside.load(Ordering::Acquire) == 0
    }

    fn total(&self) -> u32 {
        self.total.load(Ordering::Relaxed)
    }

    fn arrive(&self) -> Result<BarrierWait> {
        // Previous round still draining.
        while self.total() > ROUND_FLAG {
            self.c.wait_uncancelable(&self.m)?;
        }
        if self.total() == ROUND_FLAG {
            self.total.store(0, Ordering::Relaxed);
        }
        let total = self.total() + 1;
        self.total.store(total, Ordering::Relaxed);

        if total == self.count {
            self.total.store(total + ROUND_FLAG - 1, Ordering::Relaxed);
            self.c.broadcast()?;
            return Ok(BarrierWait::Serial);
        }

        while self.total() < ROUND_FLAG {
            self.c.wait_uncancelable(&self.m)?;
        }
        let total = self.total() - 1;
        self.total.store(total, Ordering::Relaxed);
        if total == ROUND_FLAG {
            // Last one out lets the next round in.
            self.c.broadcast()?;
        }
        Ok(BarrierWait::Released)
    }
}

/// POSIX barrier handle.
pub struct Barrier {
    handle: AtomicU64,
}

impl Drop for Barrier {
    fn drop(&mut self) {
        BARRIERS.release(&mut self.handle);
    }
}

impl Barrier {
    /// `pthread_barrier_init`. A zero `count` is `InvalidArgument`.
    pub fn init(count: u32) -> Result<Self> {
        Self::with_attr(&BarrierAttr::default(), count)
    }

    pub fn with_attr(attr: &BarrierAttr, count: u32) -> Result<Self> {
        let r = attr
            .pshared
            .require_private()
            .and_then(|()| BarrierShared::new(count))
            .and_then(|state| BARRIERS.create(state));
        let word = trace::outcome(ObjectKind::Barrier, NULL_HANDLE, "init", r)?;
        Ok(Self {
            handle: AtomicU64::new(word),
        })
    }

    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        BARRIERS.validity(self.handle())
    }

    fn traced<T>(&self, op: &'static str, r: Result<T>) -> Result<T> {
        trace::outcome(ObjectKind::Barrier, self.handle(), op, r)
    }

    fn pin(&self) -> Result<HandleRef<'static, BarrierShared>> {
        // Barriers have no static initializer.
        BARRIERS.acquire(&self.handle, |_| Err(PthreadError::InvalidHandle))
    }

    /// Parties per round.
    pub fn party_count(&self) -> Result<u32> {
        let r = self.pin().map(|b| b.count);
        self.traced("party_count", r)
    }

    /// `pthread_barrier_wait`. Not a cancellation point.
    pub fn wait(&self) -> Result<BarrierWait> {
        let r = self.wait_inner();
        self.traced("wait", r)
    }

    fn wait_inner(&self) -> Result<BarrierWait> {
        let b = self.pin()?;
        b.inside.fetch_add(1, Ordering::AcqRel);
        let r = b.m.lock().and_then(|()| {
            let arrived = b.arrive();
            let unlocked = b.m.unlock();
            arrived.and_then(|w| unlocked.map(|()| w))
        });
        b.inside.fetch_sub(1, Ordering::AcqRel);
        if let Ok(BarrierWait::Serial) = r {
            trace::event(ObjectKind::Barrier, b.word(), "round_complete");
        }
        b.unref(r)
    }

    /// `pthread_barrier_destroy`. `Busy` while any party is inside `wait`.
    pub fn destroy(&self) -> Result<()> {
        let r = BARRIERS
            .ref_for_destroy(&self.handle, BarrierShared::is_idle)
            .map(drop);
        self.traced("destroy", r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn zero_parties_is_einval() {
        assert!(matches!(
            Barrier::init(0),
            Err(PthreadError::InvalidArgument)
        ));
        assert!(matches!(
            Barrier::init(ROUND_FLAG),
            Err(PthreadError::InvalidArgument)
        ));
    }

    #[test]
    fn single_party_is_always_serial() {
        let b = Barrier::init(1).unwrap();
        for _ in 0..3 {
            assert_eq!(b.wait(), Ok(BarrierWait::Serial));
        }
        assert_eq!(BarrierWait::Serial.as_raw(), PTHREAD_BARRIER_SERIAL_THREAD);
        assert_eq!(BarrierWait::Released.as_raw(), 0);
        b.destroy().unwrap();
        assert_eq!(b.wait(), Err(PthreadError::InvalidHandle));
    }

    #[test]
    fn destroy_is_busy_while_a_party_waits() {
        let b = Arc::new(Barrier::init(2).unwrap());
        let b2 = Arc::clone(&b);
        let waiter = std::thread::spawn(move || b2.wait());
        let give_up = std::time::Instant::now() + Duration::from_secs(10);
        while BARRIERS.busy_count(b.handle()) != Some(1) {
            assert!(std::time::Instant::now() < give_up);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(b.destroy(), Err(PthreadError::Busy));
        let mine = b.wait().unwrap();
        let theirs = waiter.join().unwrap().unwrap();
        assert_ne!(mine.is_serial(), theirs.is_serial());
        b.destroy().unwrap();
    }

    #[test]
    fn process_shared_is_unsupported() {
        let mut attr = BarrierAttr::new();
        attr.set_pshared(ProcessShared::Shared);
        assert!(matches!(
            Barrier::with_attr(&attr, 2),
            Err(PthreadError::Unsupported)
        ));
    }
}
