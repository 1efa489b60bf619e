//! Error taxonomy shared by every primitive.
//!
//! Operations never panic or abort on caller misuse; they return a
//! [`PthreadError`] and leave the shared state exactly as it was. Each kind
//! maps onto the POSIX errno a C caller would have received.

use thiserror::Error;

use crate::errno;

/// Why a resource limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exhaustion {
    /// A counter would pass its configured maximum (semaphore value).
    CountOverflow,
    /// State allocation failed or an arena ran out of slots.
    Memory,
    /// A fixed-capacity structure is full (recursion depth, ownership stack).
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PthreadError {
    /// Null, destroyed, stale or otherwise unusable handle.
    #[error("invalid or destroyed handle")]
    InvalidHandle,
    /// A non-handle argument is out of range.
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("operation would deadlock the calling thread")]
    DeadlockDetected,
    #[error("calling thread does not own the object")]
    NotOwner,
    #[error("deadline expired")]
    TimedOut,
    #[error("resource exhausted ({0:?})")]
    ResourceExhausted(Exhaustion),
    #[error("unsupported attribute or operation")]
    Unsupported,
    /// A pending cancellation was acted upon at a cancellation point.
    #[error("operation canceled")]
    Canceled,
    #[error("no such thread")]
    NoSuchThread,
}

pub type Result<T> = std::result::Result<T, PthreadError>;

impl PthreadError {
    /// POSIX errno value for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidHandle | Self::InvalidArgument => errno::EINVAL,
            Self::Busy => errno::EBUSY,
            Self::DeadlockDetected => errno::EDEADLK,
            Self::NotOwner => errno::EPERM,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::ResourceExhausted(Exhaustion::CountOverflow) => errno::ERANGE,
            Self::ResourceExhausted(Exhaustion::Memory) => errno::ENOMEM,
            Self::ResourceExhausted(Exhaustion::Capacity) => errno::EAGAIN,
            Self::Unsupported => errno::ENOTSUP,
            Self::Canceled => errno::ECANCELED,
            Self::NoSuchThread => errno::ESRCH,
        }
    }

    /// Best-effort reverse mapping. `EINVAL` always decodes to
    /// [`PthreadError::InvalidHandle`]; `0` and unknown values yield `None`.
    #[must_use]
    pub const fn from_errno(value: i32) -> Option<Self> {
        Some(match value {
            errno::EINVAL => Self::InvalidHandle,
            errno::EBUSY => Self::Busy,
            errno::EDEADLK => Self::DeadlockDetected,
            errno::EPERM => Self::NotOwner,
            errno::ETIMEDOUT => Self::TimedOut,
            errno::ERANGE => Self::ResourceExhausted(Exhaustion::CountOverflow),
            errno::ENOMEM => Self::ResourceExhausted(Exhaustion::Memory),
            errno::EAGAIN => Self::ResourceExhausted(Exhaustion::Capacity),
            errno::ENOTSUP => Self::Unsupported,
            errno::ECANCELED => Self::Canceled,
            errno::ESRCH => Self::NoSuchThread,
            _ => return None,
        })
    }
}

/// Collapse an operation result into the errno-style return code of the C API.
#[must_use]
pub fn to_errno<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix() {
        assert_eq!(PthreadError::InvalidHandle.errno(), errno::EINVAL);
        assert_eq!(PthreadError::InvalidArgument.errno(), errno::EINVAL);
        assert_eq!(PthreadError::Busy.errno(), errno::EBUSY);
        assert_eq!(PthreadError::DeadlockDetected.errno(), errno::EDEADLK);
        assert_eq!(PthreadError::NotOwner.errno(), errno::EPERM);
        assert_eq!(PthreadError::TimedOut.errno(), errno::ETIMEDOUT);
        assert_eq!(PthreadError::Unsupported.errno(), errno::ENOTSUP);
        assert_eq!(PthreadError::Canceled.errno(), errno::ECANCELED);
        assert_eq!(PthreadError::NoSuchThread.errno(), errno::ESRCH);
    }

    #[test]
    fn exhaustion_reasons_pick_distinct_errnos() {
        assert_eq!(
            PthreadError::ResourceExhausted(Exhaustion::CountOverflow).errno(),
            errno::ERANGE
        );
        assert_eq!(
            PthreadError::ResourceExhausted(Exhaustion::Memory).errno(),
            errno::ENOMEM
        );
        assert_eq!(
            PthreadError::ResourceExhausted(Exhaustion::Capacity).errno(),
            errno::EAGAIN
        );
    }

    #[test]
    fn from_errno_inverts_except_einval_alias() {
        for e in [
            PthreadError::Busy,
            PthreadError::DeadlockDetected,
            PthreadError::NotOwner,
            PthreadError::TimedOut,
            PthreadError::ResourceExhausted(Exhaustion::CountOverflow),
            PthreadError::Canceled,
        ] {
            assert_eq!(PthreadError::from_errno(e.errno()), Some(e));
        }
        assert_eq!(
            PthreadError::from_errno(errno::EINVAL),
            Some(PthreadError::InvalidHandle)
        );
        assert_eq!(PthreadError::from_errno(0), None);
        assert_eq!(PthreadError::from_errno(9999), None);
    }

    #[test]
    fn to_errno_collapses_results() {
        assert_eq!(to_errno::<()>(&Ok(())), 0);
        assert_eq!(to_errno::<()>(&Err(PthreadError::Busy)), errno::EBUSY);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(PthreadError::Busy.to_string(), "resource busy");
        assert_eq!(
            PthreadError::ResourceExhausted(Exhaustion::Capacity).to_string(),
            "resource exhausted (Capacity)"
        );
    }
}
