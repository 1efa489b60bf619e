//! Spinlocks.
//!
//! [`RawSpin`] is a test-and-test-and-set lock over one atomic word. It
//! guards the handle registries, where critical sections are a handful of
//! loads and stores and must never block on another primitive.
//!
//! [`Spinlock`] is the public `pthread_spin_*` object built on the same word,
//! with owner tracking: relocking by the owner is `EDEADLK` rather than a
//! livelock, and unlock by a non-owner is `EPERM`.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::attr::ProcessShared;
use crate::error::{PthreadError, Result};
use crate::thread::{self, ThreadId};
use crate::trace::{self, ObjectKind};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spins before yielding the CPU to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct RawSpin {
    state: AtomicU32,
}

impl RawSpin {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn lock(&self) {
        while !self.try_lock() {
            self.wait_unlocked(|| false);
        }
    }

    /// Spin (read-only) until the word looks free or `stop` returns true.
    fn wait_unlocked(&self, stop: impl Fn() -> bool) {
        let mut spins = 0u32;
        while self.is_locked() && !stop() {
            if spins < SPINS_BEFORE_YIELD {
                spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

/// Data guarded by a [`RawSpin`].
pub(crate) struct SpinLock<T> {
    raw: RawSpin,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `raw`; guards hand out `&mut T`
// only while the word is held.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            raw: RawSpin::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        self.raw.lock();
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while `raw` is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while `raw` is held, and `&mut self`
        // rules out a second reference through this guard.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

// ---------------------------------------------------------------------------
// pthread_spinlock_t
// ---------------------------------------------------------------------------

/// POSIX spinlock.
pub struct Spinlock {
    raw: RawSpin,
    owner: AtomicU64,
    destroyed: AtomicBool,
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::INITIALIZER
    }
}

impl Spinlock {
    /// `PTHREAD_SPINLOCK_INITIALIZER`.
    pub const INITIALIZER: Self = Self {
        raw: RawSpin::new(),
        owner: AtomicU64::new(0),
        destroyed: AtomicBool::new(false),
    };

    /// `pthread_spin_init`. Process-shared spinlocks are not supported.
    pub fn init(pshared: ProcessShared) -> Result<Self> {
        let r = pshared.require_private().map(|()| Self::INITIALIZER);
        trace::outcome(ObjectKind::Spinlock, 0, "init", r)
    }

    fn id(&self) -> u64 {
        std::ptr::from_ref(self) as usize as u64
    }

    fn check_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PthreadError::InvalidHandle);
        }
        Ok(())
    }

    fn claim(&self, me: ThreadId) {
        self.owner.store(me, Ordering::Relaxed);
    }

    /// `pthread_spin_lock`.
    pub fn lock(&self) -> Result<()> {
        let r = self.lock_inner();
        trace::outcome(ObjectKind::Spinlock, self.id(), "lock", r)
    }

    fn lock_inner(&self) -> Result<()> {
        let me = thread::self_id();
        self.check_live()?;
        if self.owner.load(Ordering::Relaxed) == me {
            return Err(PthreadError::DeadlockDetected);
        }
        loop {
            if self.raw.try_lock() {
                if self.destroyed.load(Ordering::Acquire) {
                    self.raw.unlock();
                    return Err(PthreadError::InvalidHandle);
                }
                self.claim(me);
                return Ok(());
            }
            self.raw
                .wait_unlocked(|| self.destroyed.load(Ordering::Relaxed));
            self.check_live()?;
        }
    }

    /// `pthread_spin_trylock`.
    pub fn trylock(&self) -> Result<()> {
        let r = self.check_live().and_then(|()| {
            if self.raw.try_lock() {
                self.claim(thread::self_id());
                Ok(())
            } else {
                Err(PthreadError::Busy)
            }
        });
        trace::outcome(ObjectKind::Spinlock, self.id(), "trylock", r)
    }

    /// `pthread_spin_unlock`.
    pub fn unlock(&self) -> Result<()> {
        let r = self.check_live().and_then(|()| {
            let owned = self.owner.load(Ordering::Relaxed) == thread::self_id();
            if !self.raw.is_locked() || !owned {
                return Err(PthreadError::NotOwner);
            }
            self.owner.store(0, Ordering::Relaxed);
            self.raw.unlock();
            Ok(())
        });
        trace::outcome(ObjectKind::Spinlock, self.id(), "unlock", r)
    }

    /// `pthread_spin_destroy`. A held spinlock is `Busy`; a destroyed one
    /// rejects every further operation.
    pub fn destroy(&self) -> Result<()> {
        let r = self.check_live().and_then(|()| {
            if !self.raw.try_lock() {
                return Err(PthreadError::Busy);
            }
            // The word stays locked: late lockers observe `destroyed`.
            self.destroyed.store(true, Ordering::Release);
            Ok(())
        });
        trace::outcome(ObjectKind::Spinlock, self.id(), "destroy", r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn raw_spin_excludes() {
        let s = RawSpin::new();
        assert!(s.try_lock());
        assert!(s.is_locked());
        assert!(!s.try_lock());
        s.unlock();
        assert!(!s.is_locked());
        s.lock();
        s.unlock();
    }

    #[test]
    fn spin_guard_serializes_counter() {
        let counter = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *c.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8000);
    }

    #[test]
    fn init_rejects_process_shared() {
        assert!(Spinlock::init(ProcessShared::Private).is_ok());
        assert!(matches!(
            Spinlock::init(ProcessShared::Shared),
            Err(PthreadError::Unsupported)
        ));
    }

    #[test]
    fn owner_relock_is_edeadlk_and_trylock_ebusy() {
        let s = Spinlock::INITIALIZER;
        s.lock().unwrap();
        assert_eq!(s.lock(), Err(PthreadError::DeadlockDetected));
        assert_eq!(s.trylock(), Err(PthreadError::Busy));
        s.unlock().unwrap();
        assert_eq!(s.unlock(), Err(PthreadError::NotOwner));
    }

    #[test]
    fn non_owner_unlock_is_eperm() {
        let s = Arc::new(Spinlock::default());
        s.lock().unwrap();
        let s2 = Arc::clone(&s);
        let r = std::thread::spawn(move || s2.unlock()).join().unwrap();
        assert_eq!(r, Err(PthreadError::NotOwner));
        s.unlock().unwrap();
    }

    #[test]
    fn destroy_busy_then_dead() {
        let s = Spinlock::INITIALIZER;
        s.lock().unwrap();
        assert_eq!(s.destroy(), Err(PthreadError::Busy));
        s.unlock().unwrap();
        s.destroy().unwrap();
        assert_eq!(s.lock(), Err(PthreadError::InvalidHandle));
        assert_eq!(s.trylock(), Err(PthreadError::InvalidHandle));
        assert_eq!(s.destroy(), Err(PthreadError::InvalidHandle));
    }

    #[test]
    fn contended_lock_is_mutually_exclusive() {
        let s = Arc::new(Spinlock::INITIALIZER);
        let inside = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (s, inside) = (Arc::clone(&s), Arc::clone(&inside));
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        s.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        s.unlock().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
