//! Attribute values shared by several primitive families.

use crate::error::{PthreadError, Result};

pub const PTHREAD_PROCESS_PRIVATE: i32 = 0;
pub const PTHREAD_PROCESS_SHARED: i32 = 1;

/// Whether an object may be used from more than one process.
///
/// Only process-private objects can be created; `Shared` is accepted by the
/// attribute setters and rejected with `Unsupported` at init time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessShared {
    #[default]
    Private,
    Shared,
}

impl ProcessShared {
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            PTHREAD_PROCESS_PRIVATE => Ok(Self::Private),
            PTHREAD_PROCESS_SHARED => Ok(Self::Shared),
            _ => Err(PthreadError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Private => PTHREAD_PROCESS_PRIVATE,
            Self::Shared => PTHREAD_PROCESS_SHARED,
        }
    }

    /// `Ok` for private objects, `Unsupported` otherwise.
    pub(crate) const fn require_private(self) -> Result<()> {
        match self {
            Self::Private => Ok(()),
            Self::Shared => Err(PthreadError::Unsupported),
        }
    }
}
