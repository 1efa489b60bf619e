//! # frankenpthread-core
//!
//! POSIX threading primitives in safe Rust: mutexes, condition variables,
//! reader-writer locks, barriers, semaphores, and spinlocks, plus deferred
//! cancellation with cleanup handlers.
//!
//! Every primitive is addressed through a handle word with C-style lifecycle
//! semantics: static initializers materialize lazily, `destroy` refuses while
//! the object is in use, and a destroyed or stale handle fails with `EINVAL`
//! instead of touching freed state. All operations return
//! [`Result<T, PthreadError>`](PthreadError); [`PthreadError::errno`] gives the
//! POSIX code.
//!
//! No `unsafe` code is permitted outside the spinlock cell.

#![deny(unsafe_code)]

pub mod attr;
pub mod barrier;
pub mod cond;
pub mod config;
pub mod errno;
pub mod error;
mod handle;
pub mod mutex;
mod os;
pub mod rwlock;
pub mod sem;
#[allow(unsafe_code)]
pub mod spinlock;
pub mod thread;
pub mod time;
pub mod trace;

pub use attr::ProcessShared;
pub use barrier::{Barrier, BarrierAttr, BarrierWait};
pub use cond::{Cond, CondAttr};
pub use config::RuntimeMode;
pub use error::{Exhaustion, PthreadError, Result};
pub use handle::Validity;
pub use mutex::{Mutex, MutexAttr, MutexKind};
pub use rwlock::{RwLock, RwLockAttr, RwLockKind};
pub use sem::Semaphore;
pub use spinlock::Spinlock;
pub use thread::{CancelState, CleanupGuard, ThreadId};
pub use time::{ClockId, Deadline, Timespec};
