//! POSIX mutex operations.
//!
//! A mutex is a handle word naming a registry slot that holds its type, the
//! owning thread, the recursion depth, and the lock it blocks on. NORMAL
//! mutexes also carry a one-permit handoff semaphore: an owner that relocks
//! parks on it, and (in compat mode) the first unlock issued by another
//! thread releases it, giving the mutex back to the parked owner.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::attr::ProcessShared;
use crate::config;
use crate::errno;
use crate::error::{Exhaustion, PthreadError, Result};
use crate::handle::{self, HandleRef, NULL_HANDLE, Registry, Validity};
use crate::os::{OsLock, OsSemaphore, WaitOutcome};
use crate::thread::{self, ThreadId};
use crate::time::Deadline;
use crate::trace::{self, ObjectKind};

// ---------------------------------------------------------------------------
// Mutex type constants
// ---------------------------------------------------------------------------

/// Normal mutex: no error checking; relocking by the owner blocks.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owning thread can re-lock without deadlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: returns EDEADLK on recursive lock.
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
/// Default mutex type (alias for ERRORCHECK).
pub const PTHREAD_MUTEX_DEFAULT: i32 = 3;

pub const PTHREAD_PRIO_NONE: i32 = 0;
pub const PTHREAD_PRIO_INHERIT: i32 = 1;
pub const PTHREAD_PRIO_PROTECT: i32 = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    Normal,
    Recursive,
    #[default]
    ErrorCheck,
}

impl MutexKind {
    /// Decode a C mutex type. `PTHREAD_MUTEX_DEFAULT` maps to the default kind.
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            PTHREAD_MUTEX_NORMAL => Ok(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Ok(Self::Recursive),
            PTHREAD_MUTEX_ERRORCHECK | PTHREAD_MUTEX_DEFAULT => Ok(Self::ErrorCheck),
            _ => Err(PthreadError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
            Self::ErrorCheck => PTHREAD_MUTEX_ERRORCHECK,
        }
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Returns true if `kind` is a recognized mutex type.
#[must_use]
pub const fn valid_mutex_type(kind: i32) -> bool {
    matches!(
        kind,
        PTHREAD_MUTEX_NORMAL
            | PTHREAD_MUTEX_RECURSIVE
            | PTHREAD_MUTEX_ERRORCHECK
            | PTHREAD_MUTEX_DEFAULT
    )
}

/// Sanitize mutex type: if unknown, fall back to the default type.
#[must_use]
pub const fn sanitize_mutex_type(kind: i32) -> i32 {
    if valid_mutex_type(kind) {
        kind
    } else {
        PTHREAD_MUTEX_DEFAULT
    }
}

/// Returns true if `protocol` is a recognized priority protocol.
#[must_use]
pub const fn valid_mutex_protocol(protocol: i32) -> bool {
    matches!(
        protocol,
        PTHREAD_PRIO_NONE | PTHREAD_PRIO_INHERIT | PTHREAD_PRIO_PROTECT
    )
}

// ---------------------------------------------------------------------------
// Clean-room semantics contract
// ---------------------------------------------------------------------------

/// Phase-scoped mutex state abstraction used for clean-room transition contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    /// Handle has never been initialized.
    Uninitialized,
    /// Mutex is initialized and currently unlocked.
    Unlocked,
    /// Mutex is locked by the calling thread.
    LockedBySelf,
    /// Mutex is locked by a different thread.
    LockedByOther,
    /// Mutex has been destroyed and must be reinitialized before reuse.
    Destroyed,
}

/// Contract-level operation set for mutex transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Init,
    Lock,
    TryLock,
    Unlock,
    Destroy,
}

/// Deterministic transition result for a contract operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    /// Next abstract state after applying the operation.
    pub next: MutexContractState,
    /// POSIX errno-style result (0 on success).
    pub errno: i32,
    /// Whether the operation may block awaiting progress by another thread.
    pub blocks: bool,
}

const fn outcome(next: MutexContractState, errno: i32, blocks: bool) -> MutexContractOutcome {
    MutexContractOutcome {
        next,
        errno,
        blocks,
    }
}

/// Clean-room transition contract for NORMAL/ERRORCHECK/RECURSIVE mutexes.
///
/// `LockedBySelf` means a recursion depth of one; an unlock from there
/// always reaches `Unlocked`. `LockedByOther` unlock assumes no owner is
/// parked in a NORMAL self-deadlock.
#[must_use]
pub const fn mutex_contract_transition(
    kind: MutexKind,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractOp as Op;
    use MutexContractState as St;

    match state {
        St::Uninitialized | St::Destroyed => match op {
            Op::Init => outcome(St::Unlocked, 0, false),
            _ => outcome(state, errno::EINVAL, false),
        },
        St::Unlocked => match op {
            Op::Init => outcome(St::Unlocked, errno::EBUSY, false),
            Op::Lock | Op::TryLock => outcome(St::LockedBySelf, 0, false),
            Op::Unlock => outcome(St::Unlocked, errno::EPERM, false),
            Op::Destroy => outcome(St::Destroyed, 0, false),
        },
        St::LockedByOther => match op {
            Op::Lock => outcome(St::LockedByOther, 0, true),
            Op::Unlock => outcome(St::LockedByOther, errno::EPERM, false),
            Op::Init | Op::TryLock | Op::Destroy => {
                outcome(St::LockedByOther, errno::EBUSY, false)
            }
        },
        St::LockedBySelf => match op {
            Op::Init | Op::Destroy => outcome(St::LockedBySelf, errno::EBUSY, false),
            Op::Unlock => outcome(St::Unlocked, 0, false),
            Op::TryLock => match kind {
                MutexKind::Recursive => outcome(St::LockedBySelf, 0, false),
                _ => outcome(St::LockedBySelf, errno::EBUSY, false),
            },
            Op::Lock => match kind {
                MutexKind::Recursive => outcome(St::LockedBySelf, 0, false),
                MutexKind::ErrorCheck => outcome(St::LockedBySelf, errno::EDEADLK, false),
                MutexKind::Normal => outcome(St::LockedBySelf, 0, true),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// `pthread_mutexattr_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexAttr {
    kind: i32,
    pshared: ProcessShared,
    protocol: i32,
    prioceiling: i32,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self {
            kind: PTHREAD_MUTEX_DEFAULT,
            pshared: ProcessShared::Private,
            protocol: PTHREAD_PRIO_NONE,
            prioceiling: 0,
        }
    }
}

impl MutexAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_type(&mut self, kind: i32) -> Result<()> {
        if !valid_mutex_type(kind) {
            return Err(PthreadError::InvalidArgument);
        }
        self.kind = kind;
        Ok(())
    }

    #[must_use]
    pub fn get_type(&self) -> i32 {
        self.kind
    }

    pub fn set_pshared(&mut self, pshared: ProcessShared) {
        self.pshared = pshared;
    }

    #[must_use]
    pub fn pshared(&self) -> ProcessShared {
        self.pshared
    }

    pub fn set_protocol(&mut self, protocol: i32) -> Result<()> {
        if !valid_mutex_protocol(protocol) {
            return Err(PthreadError::InvalidArgument);
        }
        self.protocol = protocol;
        Ok(())
    }

    #[must_use]
    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn set_prioceiling(&mut self, prio: i32) -> Result<()> {
        if prio < 0 {
            return Err(PthreadError::InvalidArgument);
        }
        self.prioceiling = prio;
        Ok(())
    }

    #[must_use]
    pub fn prioceiling(&self) -> i32 {
        self.prioceiling
    }

    /// Kind to create, or `Unsupported` for process-shared and
    /// priority-protocol mutexes.
    fn resolve(&self) -> Result<MutexKind> {
        self.pshared.require_private()?;
        if self.protocol != PTHREAD_PRIO_NONE {
            return Err(PthreadError::Unsupported);
        }
        MutexKind::from_raw(self.kind)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Handoff for a NORMAL owner parked on its own mutex.
struct Handoff {
    pending: AtomicBool,
    sem: OsSemaphore,
}

pub(crate) struct MutexState {
    kind: MutexKind,
    owner: AtomicU64,
    depth: AtomicU32,
    os: OsLock,
    handoff: Option<Handoff>,
}

static MUTEXES: Registry<MutexState> = Registry::new(ObjectKind::Mutex);

impl MutexState {
    fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            os: OsLock::new(),
            handoff: matches!(kind, MutexKind::Normal).then(|| Handoff {
                pending: AtomicBool::new(false),
                sem: OsSemaphore::new(0, 1),
            }),
        }
    }

    fn from_static_code(code: u32) -> Result<Self> {
        let kind = i32::try_from(code)
            .map_err(|_| PthreadError::InvalidHandle)
            .and_then(MutexKind::from_raw)?;
        Ok(Self::new(kind))
    }

    fn is_idle(&self) -> bool {
        self.owner.load(Ordering::Acquire) == 0
    }

    fn owned_by(&self, me: ThreadId) -> bool {
        self.owner.load(Ordering::Acquire) == me
    }

    fn claim(&self, me: ThreadId) {
        self.depth.store(1, Ordering::Relaxed);
        self.owner.store(me, Ordering::Release);
    }

    fn recurse(&self) -> Result<()> {
        let depth = self.depth.load(Ordering::Relaxed);
        if depth == u32::MAX {
            return Err(PthreadError::ResourceExhausted(Exhaustion::Capacity));
        }
        self.depth.store(depth + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Owner relocked a NORMAL mutex: park until an external unlock hands it
    /// back, or until `deadline`.
    fn self_deadlock(&self, word: u64, deadline: Option<&Deadline>) -> Result<()> {
        let Some(h) = &self.handoff else {
            return Err(PthreadError::DeadlockDetected);
        };
        h.pending.store(true, Ordering::SeqCst);
        trace::event(ObjectKind::Mutex, word, "self_deadlock_park");
        match h.sem.wait(deadline, false) {
            WaitOutcome::Acquired => {}
            WaitOutcome::TimedOut | WaitOutcome::Interrupted => {
                if h.pending.swap(false, Ordering::SeqCst) {
                    return Err(PthreadError::TimedOut);
                }
                // An external unlock claimed the handoff; its permit is on the way.
                h.sem.wait(None, false);
            }
        }
        Ok(())
    }

    /// Release a parked NORMAL owner. Only the first caller succeeds.
    fn release_handoff(&self) -> bool {
        let Some(h) = &self.handoff else {
            return false;
        };
        if !h.pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        h.sem.release(1).is_ok()
    }
}

// ---------------------------------------------------------------------------
// pthread_mutex_t
// ---------------------------------------------------------------------------

/// POSIX mutex handle.
pub struct Mutex {
    handle: AtomicU64,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::INITIALIZER
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        MUTEXES.release(&mut self.handle);
    }
}

impl Mutex {
    /// `PTHREAD_MUTEX_INITIALIZER`: default (error-checking) type.
    pub const INITIALIZER: Self = Self::new_static(MutexKind::ErrorCheck);

    /// A handle that has not been initialized; every operation but
    /// [`Mutex::init_in_place`] fails with `InvalidHandle`.
    pub const UNINITIALIZED: Self = Self {
        handle: AtomicU64::new(NULL_HANDLE),
    };

    /// Static initializer for `kind`; state is allocated on first use.
    #[must_use]
    pub const fn new_static(kind: MutexKind) -> Self {
        Self {
            handle: AtomicU64::new(handle::static_handle(kind.as_raw() as u32)),
        }
    }

    /// `pthread_mutex_init` with a type.
    pub fn init(kind: MutexKind) -> Result<Self> {
        let r = MUTEXES.create(MutexState::new(kind));
        let word = trace::outcome(ObjectKind::Mutex, NULL_HANDLE, "init", r)?;
        Ok(Self {
            handle: AtomicU64::new(word),
        })
    }

    /// `pthread_mutex_init` with an attribute object.
    pub fn with_attr(attr: &MutexAttr) -> Result<Self> {
        let kind = trace::outcome(ObjectKind::Mutex, NULL_HANDLE, "init", attr.resolve())?;
        Self::init(kind)
    }

    /// Re-initialize this handle in place. A live mutex is `Busy`.
    pub fn init_in_place(&self, attr: Option<&MutexAttr>) -> Result<()> {
        let r = attr
            .map_or(Ok(MutexKind::default()), MutexAttr::resolve)
            .and_then(|kind| MUTEXES.ref_init(&self.handle, MutexState::new(kind)));
        self.traced("init", r)
    }

    /// Current handle word.
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn validity(&self) -> Validity {
        MUTEXES.validity(self.handle())
    }

    /// Operations currently pinned on this mutex (`None` unless live).
    #[must_use]
    pub fn busy_count(&self) -> Option<usize> {
        MUTEXES.busy_count(self.handle())
    }

    /// Type of the mutex, materializing a static initializer if needed.
    pub fn kind(&self) -> Result<MutexKind> {
        let r = self.pin().map(|m| m.kind);
        self.traced("kind", r)
    }

    /// Thread currently holding the mutex, if any.
    pub fn owner(&self) -> Result<Option<ThreadId>> {
        let r = MUTEXES.acquire_existing(&self.handle).map(|pin| {
            pin.and_then(|m| {
                let owner = m.owner.load(Ordering::Acquire);
                (owner != 0).then_some(owner)
            })
        });
        self.traced("owner", r)
    }

    fn traced<T>(&self, op: &'static str, r: Result<T>) -> Result<T> {
        trace::outcome(ObjectKind::Mutex, self.handle(), op, r)
    }

    fn pin(&self) -> Result<HandleRef<'static, MutexState>> {
        MUTEXES.acquire(&self.handle, MutexState::from_static_code)
    }

    /// `pthread_mutex_lock`.
    pub fn lock(&self) -> Result<()> {
        let r = self.lock_inner();
        self.traced("lock", r)
    }

    fn lock_inner(&self) -> Result<()> {
        let m = self.pin()?;
        let me = thread::self_id();
        if m.owned_by(me) {
            let r = match m.kind {
                MutexKind::Recursive => m.recurse(),
                MutexKind::ErrorCheck => Err(PthreadError::DeadlockDetected),
                MutexKind::Normal => m.self_deadlock(m.word(), None),
            };
            return m.unref(r);
        }
        if !m.os.try_acquire() {
            trace::event(ObjectKind::Mutex, m.word(), "contended");
            m.os.acquire();
        }
        m.claim(me);
        Ok(())
    }

    /// `pthread_mutex_trylock`. A non-recursive mutex held by the caller is
    /// `Busy`, not `EDEADLK`.
    pub fn trylock(&self) -> Result<()> {
        let r = self.trylock_inner();
        self.traced("trylock", r)
    }

    fn trylock_inner(&self) -> Result<()> {
        let m = self.pin()?;
        let me = thread::self_id();
        if m.owned_by(me) {
            return match m.kind {
                MutexKind::Recursive => m.recurse(),
                _ => Err(PthreadError::Busy),
            };
        }
        if !m.os.try_acquire() {
            return Err(PthreadError::Busy);
        }
        m.claim(me);
        Ok(())
    }

    /// `pthread_mutex_timedlock`. Tries once, applies the same deadlock
    /// rules as [`Mutex::lock`], then waits until `deadline`.
    pub fn timedlock(&self, deadline: Deadline) -> Result<()> {
        let r = self.timedlock_inner(&deadline);
        self.traced("timedlock", r)
    }

    fn timedlock_inner(&self, deadline: &Deadline) -> Result<()> {
        let m = self.pin()?;
        let me = thread::self_id();
        if m.owned_by(me) {
            return match m.kind {
                MutexKind::Recursive => m.recurse(),
                MutexKind::ErrorCheck => Err(PthreadError::DeadlockDetected),
                MutexKind::Normal => m.self_deadlock(m.word(), Some(deadline)),
            };
        }
        if m.os.try_acquire() || m.os.acquire_until(deadline) {
            m.claim(me);
            return Ok(());
        }
        Err(PthreadError::TimedOut)
    }

    /// `pthread_mutex_unlock`.
    pub fn unlock(&self) -> Result<()> {
        let r = self.unlock_inner();
        self.traced("unlock", r)
    }

    fn unlock_inner(&self) -> Result<()> {
        let Some(m) = MUTEXES.acquire_existing(&self.handle)? else {
            return Err(PthreadError::NotOwner);
        };
        let me = thread::self_id();
        if !m.owned_by(me) {
            let external_ok = m.kind == MutexKind::Normal
                && !m.is_idle()
                && config::runtime_mode().external_unlock_allowed()
                && m.release_handoff();
            if external_ok {
                trace::anomaly(
                    ObjectKind::Mutex,
                    m.word(),
                    "external_unlock_handoff",
                    serde_json::json!({ "owner": m.owner.load(Ordering::Relaxed) }),
                );
                return Ok(());
            }
            return Err(PthreadError::NotOwner);
        }
        let depth = m.depth.load(Ordering::Relaxed);
        if depth > 1 {
            m.depth.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        m.depth.store(0, Ordering::Relaxed);
        m.owner.store(0, Ordering::Release);
        m.os.release();
        Ok(())
    }

    /// `pthread_mutex_destroy`. `Busy` while locked or while any operation
    /// (including a condition wait using this mutex) is in flight.
    pub fn destroy(&self) -> Result<()> {
        let r = MUTEXES
            .ref_for_destroy(&self.handle, MutexState::is_idle)
            .map(drop);
        self.traced("destroy", r)
    }

    /// Pin this mutex for a condition wait; the caller must own it.
    pub(crate) fn pin_owned(&self) -> Result<OwnedMutex> {
        let Some(m) = MUTEXES.acquire_existing(&self.handle)? else {
            return Err(PthreadError::NotOwner);
        };
        if !m.owned_by(thread::self_id()) {
            return Err(PthreadError::NotOwner);
        }
        Ok(OwnedMutex { pin: m })
    }
}

/// A mutex owned by the calling thread, pinned across a condition wait.
pub(crate) struct OwnedMutex {
    pin: HandleRef<'static, MutexState>,
}

impl OwnedMutex {
    /// Identity used to bind a condition variable to this mutex.
    pub(crate) fn key(&self) -> u64 {
        self.pin.word()
    }

    /// Fully release the mutex, returning the recursion depth to restore.
    pub(crate) fn suspend(&self) -> u32 {
        let depth = self.pin.depth.swap(0, Ordering::Relaxed);
        self.pin.owner.store(0, Ordering::Release);
        self.pin.os.release();
        depth
    }

    /// Reacquire after [`OwnedMutex::suspend`]. Not a cancellation point.
    pub(crate) fn resume(&self, depth: u32) {
        self.pin.os.acquire();
        self.pin.depth.store(depth.max(1), Ordering::Relaxed);
        self.pin.owner.store(thread::self_id(), Ordering::Release);
    }
}
