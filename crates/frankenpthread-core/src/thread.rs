//! Thread identity and deferred cancellation.
//!
//! Every thread that touches a primitive gets a small shared context: a
//! stable id, the cancel-request flag, the cancel state, and a slot naming the
//! object it is currently parked on. [`cancel`] sets the flag and pokes that
//! object so the target re-checks the flag without waiting for its deadline.
//!
//! Cancellation is deferred only. A request is acted upon at the next
//! cancellation point (`testcancel`, condition/semaphore waits, rwlock
//! acquisition): the cleanup stack is unwound newest-first, the request is
//! consumed, and the operation returns [`PthreadError::Canceled`]. The thread
//! keeps running; what it does next is up to the caller.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{PthreadError, Result};
use crate::trace::{self, ObjectKind};

/// Opaque per-thread identifier. Never zero.
pub type ThreadId = u64;

/// Identity reported once a thread's context has already been torn down.
const EXITING_THREAD_ID: ThreadId = u64::MAX;

pub const PTHREAD_CANCEL_ENABLE: i32 = 0;
pub const PTHREAD_CANCEL_DISABLE: i32 = 1;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Something a cancellation point can be parked on.
///
/// Implementations must take the lock the parked thread sleeps under before
/// notifying, so a wake cannot slip between its flag check and its sleep.
pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

struct Shared {
    id: ThreadId,
    requested: AtomicBool,
    enabled: AtomicBool,
    parked: Mutex<Option<Arc<dyn Interrupt>>>,
}

static THREADS: Mutex<BTreeMap<ThreadId, Weak<Shared>>> = Mutex::new(BTreeMap::new());

struct Local {
    shared: Arc<Shared>,
}

impl Local {
    fn register() -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            requested: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            parked: Mutex::new(None),
        });
        THREADS.lock().insert(shared.id, Arc::downgrade(&shared));
        Self { shared }
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        THREADS.lock().remove(&self.shared.id);
    }
}

type CleanupHandler = Box<dyn FnOnce()>;

/// A pushed handler, tagged with the token its guard remembers.
struct CleanupEntry {
    token: u64,
    handler: CleanupHandler,
}

thread_local! {
    static LOCAL: Local = Local::register();
    static CLEANUP: RefCell<Vec<CleanupEntry>> = const { RefCell::new(Vec::new()) };
    static NEXT_TOKEN: Cell<u64> = const { Cell::new(1) };
}

fn with_shared<R>(f: impl FnOnce(&Shared) -> R) -> Option<R> {
    LOCAL.try_with(|local| f(&local.shared)).ok()
}

/// Identifier of the calling thread.
#[must_use]
pub fn self_id() -> ThreadId {
    with_shared(|s| s.id).unwrap_or(EXITING_THREAD_ID)
}

/// Request cancellation of `target`.
///
/// Fails with [`PthreadError::NoSuchThread`] if `target` never touched this
/// library or has exited.
pub fn cancel(target: ThreadId) -> Result<()> {
    let shared = THREADS
        .lock()
        .get(&target)
        .and_then(Weak::upgrade)
        .ok_or(PthreadError::NoSuchThread);
    let shared = trace::outcome(ObjectKind::Thread, target, "cancel", shared)?;

    shared.requested.store(true, Ordering::SeqCst);
    let parked = shared.parked.lock().clone();
    let woke = parked.is_some();
    if let Some(obj) = parked {
        obj.interrupt();
    }
    trace::anomaly(
        ObjectKind::Thread,
        target,
        "cancel_requested",
        serde_json::json!({ "woke_parked_waiter": woke }),
    );
    Ok(())
}

/// Whether cancellation requests are acted upon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelState {
    #[default]
    Enable,
    Disable,
}

impl CancelState {
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            PTHREAD_CANCEL_ENABLE => Ok(Self::Enable),
            PTHREAD_CANCEL_DISABLE => Ok(Self::Disable),
            _ => Err(PthreadError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Enable => PTHREAD_CANCEL_ENABLE,
            Self::Disable => PTHREAD_CANCEL_DISABLE,
        }
    }
}

/// Set the calling thread's cancel state, returning the previous one.
///
/// A request that arrives while disabled stays pending until the state is
/// re-enabled and the thread reaches a cancellation point.
pub fn set_cancel_state(state: CancelState) -> CancelState {
    let was_enabled = with_shared(|s| {
        s.enabled
            .swap(matches!(state, CancelState::Enable), Ordering::SeqCst)
    })
    .unwrap_or(true);
    if was_enabled {
        CancelState::Enable
    } else {
        CancelState::Disable
    }
}

/// Explicit cancellation point.
pub fn testcancel() -> Result<()> {
    if cancel_pending() {
        return Err(act_on_cancel());
    }
    Ok(())
}

/// True if a request is pending and cancellation is enabled.
pub(crate) fn cancel_pending() -> bool {
    with_shared(|s| s.enabled.load(Ordering::SeqCst) && s.requested.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Consume the pending request and unwind the cleanup stack.
///
/// Callers that hold a user-visible mutex across the wait reacquire it first,
/// so handlers run with it held.
pub(crate) fn act_on_cancel() -> PthreadError {
    let id = self_id();
    with_shared(|s| s.requested.store(false, Ordering::SeqCst));
    let mut ran = 0usize;
    while let Some(entry) = CLEANUP
        .try_with(|stack| stack.borrow_mut().pop())
        .ok()
        .flatten()
    {
        (entry.handler)();
        ran += 1;
    }
    trace::anomaly(
        ObjectKind::Thread,
        id,
        "cancel_unwound",
        serde_json::json!({ "handlers_run": ran }),
    );
    PthreadError::Canceled
}

/// Marks the calling thread as parked on an object until dropped.
pub(crate) struct ParkGuard {
    previous: Option<Arc<dyn Interrupt>>,
}

pub(crate) fn park_on(obj: Arc<dyn Interrupt>) -> ParkGuard {
    let previous = with_shared(|s| s.parked.lock().replace(obj)).flatten();
    ParkGuard { previous }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        with_shared(|s| *s.parked.lock() = previous);
    }
}

/// Depth of the calling thread's cleanup stack.
#[must_use]
pub fn cleanup_depth() -> usize {
    CLEANUP.try_with(|s| s.borrow().len()).unwrap_or(0)
}

/// Push a cleanup handler, returning the guard that scopes it.
///
/// The handler runs at most once: when a cancellation unwinds the stack, or
/// when the guard is popped with `execute = true`. Dropping the guard pops the
/// handler without running it. A guard only ever removes its own handler,
/// wherever it sits in the stack; once an unwind has consumed it, the guard
/// is inert.
pub fn cleanup_push<F>(handler: F) -> CleanupGuard
where
    F: FnOnce() + 'static,
{
    let token = CLEANUP
        .try_with(|s| {
            let token = NEXT_TOKEN.with(|next| next.replace(next.get() + 1));
            s.borrow_mut().push(CleanupEntry {
                token,
                handler: Box::new(handler),
            });
            token
        })
        .ok();
    CleanupGuard {
        token,
        _thread_bound: PhantomData,
    }
}

/// Scope of one pushed cleanup handler. Not `Send`: the stack is per thread.
#[must_use = "dropping the guard immediately pops the handler"]
pub struct CleanupGuard {
    /// `None` once popped, or if the stack was already torn down.
    token: Option<u64>,
    _thread_bound: PhantomData<*const ()>,
}

impl CleanupGuard {
    /// Pop the handler, running it if `execute` is true. A handler already
    /// consumed by a cancellation unwind is not run again.
    pub fn pop(mut self, execute: bool) {
        let handler = self.take();
        if execute {
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn take(&mut self) -> Option<CleanupHandler> {
        let token = self.token.take()?;
        CLEANUP
            .try_with(|s| {
                let mut stack = s.borrow_mut();
                let at = stack.iter().rposition(|e| e.token == token)?;
                Some(stack.remove(at).handler)
            })
            .ok()
            .flatten()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        drop(self.take());
    }
}
