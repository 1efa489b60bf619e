//! POSIX reader-writer lock operations.
//!
//! Built on this crate's own mutex and two condition variables (one for
//! readers, one for writers). Counters are only touched with the internal
//! mutex held. Each thread keeps a small stack of the rwlocks it holds, so
//! `unlock` knows which mode to release without a global owner table.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::attr::ProcessShared;
use crate::cond::Cond;
use crate::error::{Exhaustion, PthreadError, Result};
use crate::handle::{self, HandleRef, NULL_HANDLE, Registry, Validity};
use crate::mutex::{Mutex, MutexKind};
use crate::thread;
use crate::time::Deadline;
use crate::trace::{self, ObjectKind};

// ---------------------------------------------------------------------------
// Rwlock kind constants
// ---------------------------------------------------------------------------

/// Default rwlock: reader preference.
pub const PTHREAD_RWLOCK_DEFAULT_NP: i32 = 0;
/// Prefer readers: writers may starve.
pub const PTHREAD_RWLOCK_PREFER_READER_NP: i32 = 0;
/// Prefer writers: new readers queue behind waiting writers.
pub const PTHREAD_RWLOCK_PREFER_WRITER_NP: i32 = 1;
/// Prefer writers, non-recursive: a recursive read lock is EDEADLK.
pub const PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP: i32 = 2;

/// Rwlocks one thread can hold at once (read holds count individually).
pub const RWLOCK_OWNERSHIP_CAPACITY: usize = 16;

/// Returns true if `kind` is a recognized rwlock preference.
#[must_use]
pub const fn valid_rwlock_kind(kind: i32) -> bool {
    matches!(kind, 0..=2)
}

/// Sanitize rwlock kind: if unknown, default to DEFAULT (0).
#[must_use]
pub const fn sanitize_rwlock_kind(kind: i32) -> i32 {
    if valid_rwlock_kind(kind) {
        kind
    } else {
        PTHREAD_RWLOCK_DEFAULT_NP
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwLockKind {
    #[default]
    PreferReader,
    PreferWriter,
    PreferWriterNonrecursive,
}

impl RwLockKind {
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            PTHREAD_RWLOCK_PREFER_READER_NP => Ok(Self::PreferReader),
            PTHREAD_RWLOCK_PREFER_WRITER_NP => Ok(Self::PreferWriter),
            PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP => Ok(Self::PreferWriterNonrecursive),
            _ => Err(PthreadError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::PreferReader => PTHREAD_RWLOCK_PREFER_READER_NP,
            Self::PreferWriter => PTHREAD_RWLOCK_PREFER_WRITER_NP,
            Self::PreferWriterNonrecursive => PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP,
        }
    }

    const fn prefers_writer(self) -> bool {
        !matches!(self, Self::PreferReader)
    }
}

/// `pthread_rwlockattr_t`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RwLockAttr {
    pshared: ProcessShared,
    kind: RwLockKind,
}

impl RwLockAttr {
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

    /// `pthread_rwlockattr_setkind_np`.
    pub fn set_kind_np(&mut self, kind: i32) -> Result<()> {
        self.kind = RwLockKind::from_raw(kind)?;
        Ok(())
    }

    #[must_use]
    pub fn kind_np(&self) -> i32 {
        self.kind.as_raw()
    }
}

// ---------------------------------------------------------------------------
// Per-thread ownership stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Debug, Default, Clone, Copy)]
struct Held {
    reads: usize,
    write: bool,
}

thread_local! {
    static HELD: RefCell<Vec<(u64, Mode)>> = const { RefCell::new(Vec::new()) };
}

fn held_by_self(key: u64) -> Held {
    HELD.with_borrow(|stack| {
        stack
            .iter()
            .filter(|(k, _)| *k == key)
            .fold(Held::default(), |mut held, (_, mode)| {
                match mode {
                    Mode::Read => held.reads += 1,
                    Mode::Write => held.write = true,
                }
                held
            })
    })
}

fn ensure_room() -> Result<()> {
    if HELD.with_borrow(Vec::len) >= RWLOCK_OWNERSHIP_CAPACITY {
        return Err(PthreadError::ResourceExhausted(Exhaustion::Capacity));
    }
    Ok(())
}

fn record_hold(key: u64, mode: Mode) {
    HELD.with_borrow_mut(|stack| stack.push((key, mode)));
}

/// Forget the most recent hold of `key`, returning its mode.
fn forget_hold(key: u64) -> Option<Mode> {
    HELD.with_borrow_mut(|stack| {
        let at = stack.iter().rposition(|(k, _)| *k == key)?;
        Some(stack.remove(at).1)
    })
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub(crate) struct RwLockShared {
    kind: RwLockKind,
    m: Mutex,
    cr: Cond,
    cw: Cond,
    readers: AtomicU32,
    writer: AtomicBool,
    waiting_readers: AtomicU32,
    waiting_writers: AtomicU32,
}

static RWLOCKS: Registry<RwLockShared> = Registry::new(ObjectKind::Rwlock);

impl RwLockShared {
    fn new(kind: RwLockKind) -> Result<Self> {
        Ok(Self {
            kind,
            m: Mutex::init(MutexKind::ErrorCheck)?,
            cr: Cond::init()?,
            cw: Cond::init()?,
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
            waiting_readers: AtomicU32::new(0),
            waiting_writers: AtomicU32::new(0),
        })
    }

    fn is_idle(&self) -> bool {
        self.readers.load(Ordering::Acquire) == 0
            && !self.writer.load(Ordering::Acquire)
            && self.waiting_readers.load(Ordering::Acquire) == 0
            && self.waiting_writers.load(Ordering::Acquire) == 0
    }

    fn reader_must_wait(&self, recursive: bool) -> bool {
        self.writer.load(Ordering::Relaxed)
            || (self.kind.prefers_writer()
                && !recursive
                && self.waiting_writers.load(Ordering::Relaxed) > 0)
    }

    fn writer_must_wait(&self) -> bool {
        self.writer.load(Ordering::Relaxed) || self.readers.load(Ordering::Relaxed) > 0
    }

    /// Readers held back by a writer that has just stopped waiting.
    fn release_held_back_readers(&self) -> Result<()> {
        if self.kind.prefers_writer()
            && self.waiting_writers.load(Ordering::Relaxed) == 0
            && !self.writer.load(Ordering::Relaxed)
            && self.waiting_readers.load(Ordering::Relaxed) > 0
        {
            self.cr.broadcast()?;
        }
        Ok(())
    }

    fn wait_on(&self, cond: &Cond, deadline: Option<&Deadline>) -> Result<()> {
        match deadline {
            Some(d) => cond.timedwait(&self.m, *d),
            None => cond.wait(&self.m),
        }
    }

    /// Unlock the internal mutex, keeping the first error.
    fn finish(&self, result: Result<()>) -> Result<()> {
        let unlocked = self.m.unlock();
        result.and(unlocked)
    }
}

/// How an acquisition treats a lock it cannot take immediately.
#[derive(Debug, Clone, Copy)]
enum Blocking<'d> {
    Try,
    Wait(Option<&'d Deadline>),
}

/// Diagnostic view of an rwlock's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwLockSnapshot {
    pub readers: u32,
    pub writer: bool,
    pub waiting_readers: u32,
    pub waiting_writers: u32,
}

// ---------------------------------------------------------------------------
// pthread_rwlock_t
// ---------------------------------------------------------------------------

/// POSIX reader-writer lock handle.
pub struct RwLock {
    handle: AtomicU64,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::INITIALIZER
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        RWLOCKS.release(&mut self.handle);
    }
}

impl RwLock {
    /// `PTHREAD_RWLOCK_INITIALIZER`.
    pub const INITIALIZER: Self = Self {
        handle: AtomicU64::new(handle::static_handle(PTHREAD_RWLOCK_DEFAULT_NP as u32)),
    };

    /// `pthread_rwlock_init` with default attributes.
    pub fn init() -> Result<Self> {
        Self::with_attr(&RwLockAttr::default())
    }

    pub fn with_attr(attr: &RwLockAttr) -> Result<Self> {
        let r = attr
            .pshared
            .require_private()
            .and_then(|()| RwLockShared::new(attr.kind))
            .and_then(|state| RWLOCKS.create(state));
        let word = trace::outcome(ObjectKind::Rwlock, NULL_HANDLE, "init", r)?;
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
        RWLOCKS.validity(self.handle())
    }

    fn traced<T>(&self, op: &'static str, r: Result<T>) -> Result<T> {
        trace::outcome(ObjectKind::Rwlock, self.handle(), op, r)
    }

    fn pin(&self) -> Result<HandleRef<'static, RwLockShared>> {
        RWLOCKS.acquire(&self.handle, |code| {
            let kind = i32::try_from(code)
                .map_err(|_| PthreadError::InvalidHandle)
                .and_then(RwLockKind::from_raw)?;
            RwLockShared::new(kind)
        })
    }

    pub fn snapshot(&self) -> Result<RwLockSnapshot> {
        let r = self.pin().map(|s| RwLockSnapshot {
            readers: s.readers.load(Ordering::Acquire),
            writer: s.writer.load(Ordering::Acquire),
            waiting_readers: s.waiting_readers.load(Ordering::Acquire),
            waiting_writers: s.waiting_writers.load(Ordering::Acquire),
        });
        self.traced("snapshot", r)
    }

    /// `pthread_rwlock_rdlock`. A cancellation point.
    pub fn rdlock(&self) -> Result<()> {
        let r = self.read(Blocking::Wait(None));
        self.traced("rdlock", r)
    }

    /// `pthread_rwlock_tryrdlock`.
    pub fn tryrdlock(&self) -> Result<()> {
        let r = self.read(Blocking::Try);
        self.traced("tryrdlock", r)
    }

    /// `pthread_rwlock_timedrdlock`. A cancellation point.
    pub fn timedrdlock(&self, deadline: Deadline) -> Result<()> {
        let r = self.read(Blocking::Wait(Some(&deadline)));
        self.traced("timedrdlock", r)
    }

    /// `pthread_rwlock_wrlock`. A cancellation point.
    pub fn wrlock(&self) -> Result<()> {
        let r = self.write(Blocking::Wait(None));
        self.traced("wrlock", r)
    }

    /// `pthread_rwlock_trywrlock`.
    pub fn trywrlock(&self) -> Result<()> {
        let r = self.write(Blocking::Try);
        self.traced("trywrlock", r)
    }

    /// `pthread_rwlock_timedwrlock`. A cancellation point.
    pub fn timedwrlock(&self, deadline: Deadline) -> Result<()> {
        let r = self.write(Blocking::Wait(Some(&deadline)));
        self.traced("timedwrlock", r)
    }

    fn read(&self, blocking: Blocking<'_>) -> Result<()> {
        let deadline = match blocking {
            Blocking::Try => None,
            Blocking::Wait(deadline) => {
                thread::testcancel()?;
                Some(deadline)
            }
        };
        let pin = self.pin()?;
        let key = pin.word();
        let held = held_by_self(key);
        let reentry_refused =
            held.write || (held.reads > 0 && pin.kind == RwLockKind::PreferWriterNonrecursive);
        if reentry_refused {
            return Err(match blocking {
                Blocking::Try => PthreadError::Busy,
                Blocking::Wait(_) => PthreadError::DeadlockDetected,
            });
        }
        ensure_room()?;

        let s = pin.arc();
        let recursive = held.reads > 0;
        s.m.lock()?;
        if s.reader_must_wait(recursive) {
            let Some(deadline) = deadline else {
                return s.finish(Err(PthreadError::Busy));
            };
            s.waiting_readers.fetch_add(1, Ordering::Relaxed);
            let cleanup = {
                let s = Arc::clone(&s);
                thread::cleanup_push(move || {
                    s.waiting_readers.fetch_sub(1, Ordering::Relaxed);
                    let _ = s.m.unlock();
                })
            };
            let mut waited = Ok(());
            while s.reader_must_wait(recursive) {
                waited = s.wait_on(&s.cr, deadline);
                if waited == Err(PthreadError::Canceled) {
                    // The cleanup handler already ran and released the mutex.
                    return waited;
                }
                if waited.is_err() {
                    break;
                }
            }
            cleanup.pop(false);
            s.waiting_readers.fetch_sub(1, Ordering::Relaxed);
            if waited.is_err() {
                return s.finish(waited);
            }
        }
        s.readers.fetch_add(1, Ordering::Relaxed);
        record_hold(key, Mode::Read);
        s.finish(Ok(()))
    }

    fn write(&self, blocking: Blocking<'_>) -> Result<()> {
        let deadline = match blocking {
            Blocking::Try => None,
            Blocking::Wait(deadline) => {
                thread::testcancel()?;
                Some(deadline)
            }
        };
        let pin = self.pin()?;
        let key = pin.word();
        let held = held_by_self(key);
        if held.write || held.reads > 0 {
            return Err(match blocking {
                Blocking::Try => PthreadError::Busy,
                Blocking::Wait(_) => PthreadError::DeadlockDetected,
            });
        }
        ensure_room()?;

        let s = pin.arc();
        s.m.lock()?;
        if s.writer_must_wait() {
            let Some(deadline) = deadline else {
                return s.finish(Err(PthreadError::Busy));
            };
            s.waiting_writers.fetch_add(1, Ordering::Relaxed);
            trace::event(ObjectKind::Rwlock, key, "writer_queued");
            let cleanup = {
                let s = Arc::clone(&s);
                thread::cleanup_push(move || {
                    s.waiting_writers.fetch_sub(1, Ordering::Relaxed);
                    let _ = s.release_held_back_readers();
                    let _ = s.m.unlock();
                })
            };
            let mut waited = Ok(());
            while s.writer_must_wait() {
                waited = s.wait_on(&s.cw, deadline);
                if waited == Err(PthreadError::Canceled) {
                    return waited;
                }
                if waited.is_err() {
                    break;
                }
            }
            cleanup.pop(false);
            s.waiting_writers.fetch_sub(1, Ordering::Relaxed);
            if waited.is_err() {
                let woke = s.release_held_back_readers();
                return s.finish(waited.and(woke));
            }
        }
        s.writer.store(true, Ordering::Relaxed);
        record_hold(key, Mode::Write);
        s.finish(Ok(()))
    }

    /// `pthread_rwlock_unlock`. Releases the mode the calling thread holds;
    /// a thread holding neither is `NotOwner`.
    pub fn unlock(&self) -> Result<()> {
        let r = self.unlock_inner();
        self.traced("unlock", r)
    }

    fn unlock_inner(&self) -> Result<()> {
        let Some(pin) = RWLOCKS.acquire_existing(&self.handle)? else {
            return Err(PthreadError::NotOwner);
        };
        let mode = forget_hold(pin.word()).ok_or(PthreadError::NotOwner)?;
        let s = &*pin;
        s.m.lock()?;
        let woke = match mode {
            Mode::Write => {
                s.writer.store(false, Ordering::Relaxed);
                let readers = s.waiting_readers.load(Ordering::Relaxed);
                let writers = s.waiting_writers.load(Ordering::Relaxed);
                if s.kind.prefers_writer() && writers > 0 {
                    s.cw.signal()
                } else if readers == 1 {
                    s.cr.signal()
                } else if readers > 1 {
                    s.cr.broadcast()
                } else if writers > 0 {
                    s.cw.signal()
                } else {
                    Ok(())
                }
            }
            Mode::Read => {
                let left = s.readers.fetch_sub(1, Ordering::Relaxed) - 1;
                if left == 0 && s.waiting_writers.load(Ordering::Relaxed) > 0 {
                    s.cw.signal()
                } else {
                    Ok(())
                }
            }
        };
        s.finish(woke)
    }

    /// `pthread_rwlock_destroy`. `Busy` while held or while threads wait.
    pub fn destroy(&self) -> Result<()> {
        let r = RWLOCKS
            .ref_for_destroy(&self.handle, RwLockShared::is_idle)
            .map(drop);
        self.traced("destroy", r)
    }
}
