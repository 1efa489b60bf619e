//! POSIX counting semaphores.
//!
//! The count lives under its own lock and may go negative: `-n` means `n`
//! threads are blocked. Blocked threads sleep on a separate OS semaphore that
//! only ever holds permits handed over by `post` to a blocked waiter.

use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::attr::ProcessShared;
use crate::error::{Exhaustion, PthreadError, Result};
use crate::handle::{HandleRef, NULL_HANDLE, Registry, Validity};
use crate::os::{OsSemaphore, WaitOutcome};
use crate::thread;
use crate::time::Deadline;
use crate::trace::{self, ObjectKind};

/// Largest count a semaphore may hold.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

pub(crate) struct SemShared {
    value: PlMutex<i64>,
    max: i64,
    os: OsSemaphore,
}

static SEMAPHORES: Registry<SemShared> = Registry::new(ObjectKind::Semaphore);

impl SemShared {
    fn new(initial: u32, max: u32) -> Result<Self> {
        if initial > max || max > SEM_VALUE_MAX {
            return Err(PthreadError::InvalidArgument);
        }
        Ok(Self {
            value: PlMutex::new(i64::from(initial)),
            max: i64::from(max),
            os: OsSemaphore::new(0, SEM_VALUE_MAX),
        })
    }

    /// No blocked waiters. Contention on the count means someone is mid-call
    /// and therefore pinned, so a failed `try_lock` reads as busy.
    fn is_idle(&self) -> bool {
        self.value.try_lock().is_some_and(|v| *v >= 0)
    }

    /// Add `n` to the count, handing permits to up to `n` blocked waiters.
    fn post(&self, n: u32) -> Result<()> {
        let mut value = self.value.lock();
        let next = *value + i64::from(n);
        if next > self.max {
            return Err(PthreadError::ResourceExhausted(Exhaustion::CountOverflow));
        }
        let wake = (-*value).max(0).min(i64::from(n));
        if wake > 0 {
            // Handoff permits never outnumber blocked waiters.
            self.os
                .release(u32::try_from(wake).unwrap_or(SEM_VALUE_MAX))?;
        }
        *value = next;
        Ok(())
    }
}

/// POSIX semaphore handle.
pub struct Semaphore {
    handle: AtomicU64,
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        SEMAPHORES.release(&mut self.handle);
    }
}

impl Semaphore {
    /// `sem_init` for a process-private semaphore holding `initial` permits,
    /// never more than `max`.
    pub fn init(initial: u32, max: u32) -> Result<Self> {
        Self::with_pshared(ProcessShared::Private, initial, max)
    }

    /// `sem_init` with an explicit sharing mode. Shared is `Unsupported`.
    pub fn with_pshared(pshared: ProcessShared, initial: u32, max: u32) -> Result<Self> {
        let r = pshared
            .require_private()
            .and_then(|()| SemShared::new(initial, max))
            .and_then(|state| SEMAPHORES.create(state));
        let word = trace::outcome(ObjectKind::Semaphore, NULL_HANDLE, "init", r)?;
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
        SEMAPHORES.validity(self.handle())
    }

    fn traced<T>(&self, op: &'static str, r: Result<T>) -> Result<T> {
        trace::outcome(ObjectKind::Semaphore, self.handle(), op, r)
    }

    fn pin(&self) -> Result<HandleRef<'static, SemShared>> {
        SEMAPHORES.acquire(&self.handle, |_| Err(PthreadError::InvalidHandle))
    }

    /// `sem_wait`. A cancellation point.
    pub fn wait(&self) -> Result<()> {
        let r = self.wait_inner(None);
        self.traced("wait", r)
    }

    /// `sem_timedwait`. A cancellation point.
    pub fn timedwait(&self, deadline: Deadline) -> Result<()> {
        let r = self.wait_inner(Some(&deadline));
        self.traced("timedwait", r)
    }

    fn wait_inner(&self, deadline: Option<&Deadline>) -> Result<()> {
        thread::testcancel()?;
        let s = self.pin()?;
        {
            let mut value = s.value.lock();
            *value -= 1;
            if *value >= 0 {
                return Ok(());
            }
        }
        trace::event(ObjectKind::Semaphore, s.word(), "blocked");
        let failure = match s.os.wait(deadline, true) {
            WaitOutcome::Acquired => return Ok(()),
            WaitOutcome::TimedOut => PthreadError::TimedOut,
            WaitOutcome::Interrupted => PthreadError::Canceled,
        };
        {
            let mut value = s.value.lock();
            if s.os.try_acquire() {
                // A post handed us a permit after all.
                return Ok(());
            }
            *value += 1;
        }
        drop(s);
        match failure {
            PthreadError::Canceled => Err(thread::act_on_cancel()),
            other => Err(other),
        }
    }

    /// `sem_trywait`. `Busy` when no permit is available.
    pub fn trywait(&self) -> Result<()> {
        let r = self.pin().and_then(|s| {
            let mut value = s.value.lock();
            if *value <= 0 {
                return Err(PthreadError::Busy);
            }
            *value -= 1;
            Ok(())
        });
        self.traced("trywait", r)
    }

    /// `sem_post`. Exceeding the maximum is `ResourceExhausted` (`ERANGE`).
    pub fn post(&self) -> Result<()> {
        let r = self.pin().and_then(|s| s.post(1));
        self.traced("post", r)
    }

    /// `sem_post_multiple`: add `n` permits at once.
    pub fn post_multiple(&self, n: u32) -> Result<()> {
        let r = if n == 0 {
            Err(PthreadError::InvalidArgument)
        } else {
            self.pin().and_then(|s| s.post(n))
        };
        self.traced("post_multiple", r)
    }

    /// `sem_getvalue`. Negative while threads are blocked.
    pub fn get_value(&self) -> Result<i32> {
        let r = self.pin().map(|s| {
            let value = *s.value.lock();
            i32::try_from(value).unwrap_or(i32::MIN)
        });
        self.traced("get_value", r)
    }

    /// `sem_destroy`. `Busy` while threads are blocked or operations run.
    pub fn destroy(&self) -> Result<()> {
        let r = SEMAPHORES
            .ref_for_destroy(&self.handle, SemShared::is_idle)
            .map(drop);
        self.traced("destroy", r)
    }
}
