//! Native blocking objects the primitives are layered on.
//!
//! [`OsLock`] is an ownerless binary lock with timed acquisition, and
//! [`OsSemaphore`] is a bounded counting semaphore whose waits can be
//! interrupted by a cancellation request. Both sit on `parking_lot`.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::error::{Exhaustion, PthreadError, Result};
use crate::thread::{self, Interrupt};
use crate::time::{self, Deadline};

/// Binary lock. Any thread may release it; ownership is tracked by callers.
pub(crate) struct OsLock {
    held: Mutex<bool>,
    cv: Condvar,
}

impl OsLock {
    pub(crate) const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cv.wait(&mut held);
        }
        *held = true;
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    /// Acquire before `deadline`; false on timeout.
    pub(crate) fn acquire_until(&self, deadline: &Deadline) -> bool {
        let mut held = self.held.lock();
        loop {
            if !*held {
                *held = true;
                return true;
            }
            if time::park(&self.cv, &mut held, Some(deadline)) {
                if !*held {
                    *held = true;
                    return true;
                }
                return false;
            }
        }
    }

    pub(crate) fn release(&self) {
        *self.held.lock() = false;
        self.cv.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// How a semaphore wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Acquired,
    TimedOut,
    /// A cancellation request is pending for the waiter.
    Interrupted,
}

struct SemCore {
    permits: Mutex<u32>,
    cv: Condvar,
}

impl Interrupt for SemCore {
    fn interrupt(&self) {
        let _permits = self.permits.lock();
        self.cv.notify_all();
    }
}

/// Counting semaphore holding at most `max` permits.
pub(crate) struct OsSemaphore {
    core: Arc<SemCore>,
    max: u32,
}

impl OsSemaphore {
    pub(crate) fn new(initial: u32, max: u32) -> Self {
        Self {
            core: Arc::new(SemCore {
                permits: Mutex::new(initial.min(max)),
                cv: Condvar::new(),
            }),
            max,
        }
    }

    /// Take one permit, blocking until one is released or `deadline` passes.
    ///
    /// A `cancelable` wait parks the calling thread on this semaphore so that
    /// `thread::cancel` can wake it, and returns `Interrupted` instead of
    /// sleeping while a request is pending.
    pub(crate) fn wait(&self, deadline: Option<&Deadline>, cancelable: bool) -> WaitOutcome {
        let _park = cancelable.then(|| {
            let obj: Arc<dyn Interrupt> = self.core.clone();
            thread::park_on(obj)
        });
        let mut permits = self.core.permits.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return WaitOutcome::Acquired;
            }
            if cancelable && thread::cancel_pending() {
                return WaitOutcome::Interrupted;
            }
            if time::park(&self.core.cv, &mut permits, deadline) {
                if *permits > 0 {
                    *permits -= 1;
                    return WaitOutcome::Acquired;
                }
                return WaitOutcome::TimedOut;
            }
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut permits = self.core.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Add `n` permits and wake up to `n` waiters.
    pub(crate) fn release(&self, n: u32) -> Result<()> {
        let mut permits = self.core.permits.lock();
        let next = permits
            .checked_add(n)
            .filter(|&v| v <= self.max)
            .ok_or(PthreadError::ResourceExhausted(Exhaustion::CountOverflow))?;
        *permits = next;
        drop(permits);
        if n == 1 {
            self.core.cv.notify_one();
        } else {
            self.core.cv.notify_all();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> u32 {
        *self.core.permits.lock()
    }
}
