//! POSIX condition variables.
//!
//! Waiters queue a ticket before releasing the mutex; `signal` flips the
//! oldest ticket and `broadcast` flips all of them, both under the queue
//! lock. A waiter returns once its ticket is flipped, so a wakeup is never
//! lost and never lands on a waiter that already left.

use parking_lot::{Condvar, Mutex as PlMutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::attr::ProcessShared;
use crate::error::{PthreadError, Result};
use crate::handle::{self, HandleRef, NULL_HANDLE, Registry, Validity};
use crate::mutex::Mutex;
use crate::thread::{self, Interrupt};
use crate::time::{self, ClockId, Deadline, Timespec};
use crate::trace::{self, ObjectKind};

/// `pthread_condattr_t`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CondAttr {
    pshared: ProcessShared,
    clock: ClockId,
}

impl CondAttr {
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

    /// Clock against which [`Cond::timedwait_timespec`] reads its deadline.
    pub fn set_clock(&mut self, clock: ClockId) {
        self.clock = clock;
    }

    #[must_use]
    pub fn clock(&self) -> ClockId {
        self.clock
    }
}

type Ticket = Arc<AtomicBool>;

struct CondQueue {
    waiters: VecDeque<Ticket>,
    /// Woken waiters that have not yet left.
    signaled: usize,
    /// Mutex the current set of waiters is using.
    bound: Option<u64>,
}

impl CondQueue {
    fn outstanding(&self) -> usize {
        self.waiters.len() + self.signaled
    }
}

pub(crate) struct CondShared {
    queue: PlMutex<CondQueue>,
    cv: Condvar,
    clock: ClockId,
    waiting: AtomicUsize,
}

static CONDS: Registry<CondShared> = Registry::new(ObjectKind::Cond);

impl CondShared {
    fn new(clock: ClockId) -> Self {
        Self {
            queue: PlMutex::new(CondQueue {
                waiters: VecDeque::new(),
                signaled: 0,
                bound: None,
            }),
            cv: Condvar::new(),
            clock,
            waiting: AtomicUsize::new(0),
        }
    }

    fn is_idle(&self) -> bool {
        self.waiting.load(Ordering::Acquire) == 0
    }
}

impl Interrupt for CondShared {
    fn interrupt(&self) {
        let _queue = self.queue.lock();
        self.cv.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Woken {
    Signaled,
    TimedOut,
    Canceled,
}

/// POSIX condition variable handle.
pub struct Cond {
    handle: AtomicU64,
}

impl Default for Cond {
    fn default() -> Self {
        Self::INITIALIZER
    }
}

impl Drop for Cond {
    fn drop(&mut self) {
        CONDS.release(&mut self.handle);
    }
}

impl Cond {
    /// `PTHREAD_COND_INITIALIZER`.
    pub const INITIALIZER: Self = Self {
        handle: AtomicU64::new(handle::static_handle(0)),
    };

    /// `pthread_cond_init` with default attributes.
    pub fn init() -> Result<Self> {
        Self::with_attr(&CondAttr::default())
    }

    pub fn with_attr(attr: &CondAttr) -> Result<Self> {
        let r = attr
            .pshared
            .require_private()
            .and_then(|()| CONDS.create(CondShared::new(attr.clock)));
        let word = trace::outcome(ObjectKind::Cond, NULL_HANDLE, "init", r)?;
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
        CONDS.validity(self.handle())
    }

    fn traced<T>(&self, op: &'static str, r: Result<T>) -> Result<T> {
        trace::outcome(ObjectKind::Cond, self.handle(), op, r)
    }

    fn pin(&self) -> Result<HandleRef<'static, CondShared>> {
        CONDS.acquire(&self.handle, |_| Ok(CondShared::new(ClockId::default())))
    }

    /// Threads currently queued or woken but not yet returned.
    pub fn waiter_count(&self) -> Result<usize> {
        let r = CONDS
            .acquire_existing(&self.handle)
            .map(|pin| pin.map_or(0, |c| c.waiting.load(Ordering::Acquire)));
        self.traced("waiter_count", r)
    }

    /// Clock used by [`Cond::timedwait_timespec`].
    pub fn clock(&self) -> Result<ClockId> {
        let r = self.pin().map(|c| c.clock);
        self.traced("clock", r)
    }

    /// `pthread_cond_signal`: wake the oldest waiter, if any.
    pub fn signal(&self) -> Result<()> {
        let r = self.wake(false);
        self.traced("signal", r)
    }

    /// `pthread_cond_broadcast`: wake every thread waiting right now.
    pub fn broadcast(&self) -> Result<()> {
        let r = self.wake(true);
        self.traced("broadcast", r)
    }

    fn wake(&self, all: bool) -> Result<()> {
        // A never-materialized condition has no waiters.
        let Some(c) = CONDS.acquire_existing(&self.handle)? else {
            return Ok(());
        };
        let mut q = c.queue.lock();
        let n = if all { q.waiters.len() } else { q.waiters.len().min(1) };
        if n == 0 {
            return Ok(());
        }
        for ticket in q.waiters.drain(..n) {
            ticket.store(true, Ordering::Release);
        }
        q.signaled += n;
        drop(q);
        c.cv.notify_all();
        Ok(())
    }

    /// `pthread_cond_wait`. A cancellation point.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        let r = self.wait_inner(mutex, None, true);
        self.traced("wait", r)
    }

    /// `pthread_cond_timedwait`. On `TimedOut` the mutex is held again.
    pub fn timedwait(&self, mutex: &Mutex, deadline: Deadline) -> Result<()> {
        let r = self.wait_inner(mutex, Some(&deadline), true);
        self.traced("timedwait", r)
    }

    /// `pthread_cond_timedwait` with an absolute timespec read against the
    /// condition's clock attribute.
    pub fn timedwait_timespec(&self, mutex: &Mutex, abstime: Timespec) -> Result<()> {
        let deadline = self
            .clock()
            .and_then(|clock| Deadline::from_timespec(clock, abstime));
        let deadline = self.traced("timedwait", deadline)?;
        self.timedwait(mutex, deadline)
    }

    /// Wait that is not a cancellation point.
    pub(crate) fn wait_uncancelable(&self, mutex: &Mutex) -> Result<()> {
        let r = self.wait_inner(mutex, None, false);
        self.traced("wait", r)
    }

    fn wait_inner(
        &self,
        mutex: &Mutex,
        deadline: Option<&Deadline>,
        cancelable: bool,
    ) -> Result<()> {
        if cancelable {
            thread::testcancel()?;
        }
        let c = self.pin()?;
        let owned = mutex.pin_owned()?;
        let ticket: Ticket = Arc::new(AtomicBool::new(false));
        {
            let mut q = c.queue.lock();
            match q.bound {
                Some(key) if key != owned.key() && q.outstanding() > 0 => {
                    return Err(PthreadError::InvalidArgument);
                }
                _ => q.bound = Some(owned.key()),
            }
            q.waiters.push_back(Arc::clone(&ticket));
            c.waiting.fetch_add(1, Ordering::AcqRel);
        }

        let depth = owned.suspend();
        let park = cancelable.then(|| {
            let obj: Arc<dyn Interrupt> = c.arc();
            thread::park_on(obj)
        });
        let woken = {
            let mut q = c.queue.lock();
            let woken = loop {
                if ticket.load(Ordering::Acquire) {
                    break Woken::Signaled;
                }
                if cancelable && thread::cancel_pending() {
                    break Woken::Canceled;
                }
                if time::park(&c.cv, &mut q, deadline) {
                    break if ticket.load(Ordering::Acquire) {
                        Woken::Signaled
                    } else {
                        Woken::TimedOut
                    };
                }
            };
            if woken == Woken::Signaled {
                q.signaled -= 1;
            } else {
                q.waiters.retain(|t| !Arc::ptr_eq(t, &ticket));
            }
            if q.outstanding() == 0 {
                q.bound = None;
            }
            c.waiting.fetch_sub(1, Ordering::AcqRel);
            woken
        };
        drop(park);
        owned.resume(depth);

        match woken {
            Woken::Signaled => Ok(()),
            Woken::TimedOut => Err(PthreadError::TimedOut),
            Woken::Canceled => Err(thread::act_on_cancel()),
        }
    }

    /// `pthread_cond_destroy`. `Busy` while any thread is waiting.
    pub fn destroy(&self) -> Result<()> {
        let r = CONDS
            .ref_for_destroy(&self.handle, CondShared::is_idle)
            .map(drop);
        self.traced("destroy", r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MutexKind;
    use std::time::Duration;

    fn spin_until(mut f: impl FnMut() -> bool) {
        let give_up = std::time::Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(std::time::Instant::now() < give_up, "condition never held");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn signal_without_waiters_is_a_no_op() {
        let c = Cond::INITIALIZER;
        c.signal().unwrap();
        c.broadcast().unwrap();
        assert_eq!(c.validity(), Validity::UninitializedStatic);
        assert_eq!(c.waiter_count(), Ok(0));
    }

    #[test]
    fn wait_requires_owned_mutex() {
        let c = Cond::init().unwrap();
        let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
        assert_eq!(c.wait(&m), Err(PthreadError::NotOwner));
        let unmaterialized = Mutex::INITIALIZER;
        assert_eq!(c.wait(&unmaterialized), Err(PthreadError::NotOwner));
    }

    #[test]
    fn timedwait_times_out_holding_mutex() {
        let c = Cond::init().unwrap();
        let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        let r = c.timedwait(&m, Deadline::after(Duration::from_millis(20)));
        assert_eq!(r, Err(PthreadError::TimedOut));
        assert_eq!(m.owner().unwrap(), Some(thread::self_id()));
        assert_eq!(c.waiter_count(), Ok(0));
        m.unlock().unwrap();
    }

    #[test]
    fn timedwait_rejects_bad_timespec() {
        let c = Cond::init().unwrap();
        let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        assert_eq!(
            c.timedwait_timespec(&m, Timespec::new(0, 1_000_000_000)),
            Err(PthreadError::InvalidArgument)
        );
        m.unlock().unwrap();
    }

    #[test]
    fn monotonic_clock_attribute_is_honored() {
        let mut attr = CondAttr::new();
        attr.set_clock(ClockId::Monotonic);
        let c = Cond::with_attr(&attr).unwrap();
        assert_eq!(c.clock(), Ok(ClockId::Monotonic));
        let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        let abstime = Deadline::monotonic_now().saturating_add(Duration::from_millis(20));
        assert_eq!(
            c.timedwait_timespec(&m, abstime),
            Err(PthreadError::TimedOut)
        );
        m.unlock().unwrap();
    }

    #[test]
    fn process_shared_is_unsupported() {
        let mut attr = CondAttr::new();
        attr.set_pshared(ProcessShared::Shared);
        assert!(matches!(
            Cond::with_attr(&attr),
            Err(PthreadError::Unsupported)
        ));
    }

    #[test]
    fn signal_wakes_waiter_and_destroy_waits_for_it() {
        let c = Arc::new(Cond::init().unwrap());
        let m = Arc::new(Mutex::init(MutexKind::Normal).unwrap());
        let ready = Arc::new(AtomicBool::new(false));
        let (c2, m2, r2) = (Arc::clone(&c), Arc::clone(&m), Arc::clone(&ready));
        let waiter = std::thread::spawn(move || {
            m2.lock().unwrap();
            while !r2.load(Ordering::SeqCst) {
                c2.wait(&m2).unwrap();
            }
            m2.unlock().unwrap();
        });
        spin_until(|| c.waiter_count() == Ok(1));
        assert_eq!(c.destroy(), Err(PthreadError::Busy));
        assert_eq!(m.destroy(), Err(PthreadError::Busy));
        m.lock().unwrap();
        ready.store(true, Ordering::SeqCst);
        c.signal().unwrap();
        m.unlock().unwrap();
        waiter.join().unwrap();
        c.destroy().unwrap();
        assert_eq!(c.signal(), Err(PthreadError::InvalidHandle));
    }

    #[test]
    fn second_mutex_is_rejected_while_bound() {
        let c = Arc::new(Cond::init().unwrap());
        let m1 = Arc::new(Mutex::init(MutexKind::ErrorCheck).unwrap());
        let (c2, m2) = (Arc::clone(&c), Arc::clone(&m1));
        let waiter = std::thread::spawn(move || {
            m2.lock().unwrap();
            let r = c2.wait(&m2);
            m2.unlock().unwrap();
            r
        });
        spin_until(|| c.waiter_count() == Ok(1));

        let other = Mutex::init(MutexKind::ErrorCheck).unwrap();
        other.lock().unwrap();
        assert_eq!(c.wait(&other), Err(PthreadError::InvalidArgument));
        other.unlock().unwrap();

        c.signal().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));

        // Binding cleared with the last waiter.
        other.lock().unwrap();
        assert_eq!(
            c.timedwait(&other, Deadline::after(Duration::from_millis(5))),
            Err(PthreadError::TimedOut)
        );
        other.unlock().unwrap();
    }

    #[test]
    fn recursive_depth_survives_wait() {
        let c = Cond::init().unwrap();
        let m = Mutex::init(MutexKind::Recursive).unwrap();
        m.lock().unwrap();
        m.lock().unwrap();
        assert_eq!(
            c.timedwait(&m, Deadline::after(Duration::from_millis(5))),
            Err(PthreadError::TimedOut)
        );
        m.unlock().unwrap();
        assert_eq!(m.owner().unwrap(), Some(thread::self_id()));
        m.unlock().unwrap();
        assert_eq!(m.owner().unwrap(), None);
    }

    #[test]
    fn pending_cancel_is_acted_on_at_entry() {
        let c = Cond::init().unwrap();
        let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        thread::cancel(thread::self_id()).unwrap();
        assert_eq!(c.wait(&m), Err(PthreadError::Canceled));
        assert_eq!(m.owner().unwrap(), Some(thread::self_id()));
        m.unlock().unwrap();
    }
}
