//! Runtime mode configuration.
//!
//! The runtime mode is set via the `FRANKENPTHREAD_MODE` environment variable:
//! - `compat` (default): a NORMAL mutex that its owner relocked (self-deadlock)
//!   can be released by exactly one unlock from another thread. That unlock
//!   hands the mutex back to the blocked owner instead of failing.
//! - `strict`: every unlock by a non-owner fails with `EPERM`, including the
//!   NORMAL self-deadlock case. A self-deadlocked NORMAL mutex then stays
//!   blocked until its deadline (timed lock) or forever.
//!
//! The trace level is set via `FRANKENPTHREAD_TRACE` and is resolved by
//! [`crate::trace`] through the same state machine.

use std::sync::atomic::{AtomicU8, Ordering};

/// Policy for unlocks issued by a thread that does not own a NORMAL mutex.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeMode {
    /// External unlock releases one pending self-deadlock handoff.
    #[default]
    Compat,
    /// Non-owner unlocks are rejected uniformly.
    Strict,
}

impl RuntimeMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "strict" | "posix" | "reject" => Self::Strict,
            "compat" | "default" | "winpthreads" => Self::Compat,
            _ => Self::Compat,
        }
    }

    /// Returns true if a non-owner unlock may release a pending handoff.
    #[must_use]
    pub const fn external_unlock_allowed(self) -> bool {
        matches!(self, Self::Compat)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Strict => "strict",
        }
    }
}

// Atomic cache: 0=unresolved, 1=Compat, 2=Strict, 255=resolving.
static CACHED_MODE: AtomicU8 = AtomicU8::new(CACHE_UNRESOLVED);

pub(crate) const CACHE_UNRESOLVED: u8 = 0;
pub(crate) const CACHE_RESOLVING: u8 = 255;

const MODE_COMPAT: u8 = 1;
const MODE_STRICT: u8 = 2;

fn mode_to_u8(mode: RuntimeMode) -> u8 {
    match mode {
        RuntimeMode::Compat => MODE_COMPAT,
        RuntimeMode::Strict => MODE_STRICT,
    }
}

fn u8_to_mode(v: u8) -> RuntimeMode {
    match v {
        MODE_STRICT => RuntimeMode::Strict,
        _ => RuntimeMode::Compat,
    }
}

/// Resolve a cached `u8` setting from the environment exactly once.
///
/// Concurrent callers that lose the resolution race get `fallback` until the
/// winner publishes. A value already stored (by a programmatic override) is
/// never replaced by the environment.
pub(crate) fn resolve_cached(
    cache: &AtomicU8,
    var: &str,
    parse: fn(&str) -> u8,
    fallback: u8,
) -> u8 {
    let cached = cache.load(Ordering::Relaxed);
    if cached != CACHE_UNRESOLVED && cached != CACHE_RESOLVING {
        return cached;
    }
    if cached == CACHE_RESOLVING {
        return fallback;
    }
    if cache
        .compare_exchange(
            CACHE_UNRESOLVED,
            CACHE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = cache.load(Ordering::Relaxed);
        return if v != CACHE_UNRESOLVED && v != CACHE_RESOLVING {
            v
        } else {
            fallback
        };
    }

    let value = std::env::var(var).map(|v| parse(&v)).unwrap_or(fallback);
    if cache
        .compare_exchange(CACHE_RESOLVING, value, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Overridden while we were reading the environment.
        return cache.load(Ordering::Acquire);
    }
    value
}

/// Get the configured runtime mode (reads env var on first call, caches thereafter).
#[must_use]
pub fn runtime_mode() -> RuntimeMode {
    u8_to_mode(resolve_cached(
        &CACHED_MODE,
        "FRANKENPTHREAD_MODE",
        |raw| mode_to_u8(RuntimeMode::from_str_loose(raw)),
        MODE_COMPAT,
    ))
}

/// Override the runtime mode for the rest of the process, returning the
/// previous value.
pub fn set_runtime_mode(mode: RuntimeMode) -> RuntimeMode {
    let previous = runtime_mode();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_runtime_modes() {
        assert_eq!(RuntimeMode::from_str_loose("compat"), RuntimeMode::Compat);
        assert_eq!(RuntimeMode::from_str_loose("COMPAT"), RuntimeMode::Compat);
        assert_eq!(
            RuntimeMode::from_str_loose("winpthreads"),
            RuntimeMode::Compat
        );
        assert_eq!(RuntimeMode::from_str_loose("strict"), RuntimeMode::Strict);
        assert_eq!(RuntimeMode::from_str_loose("Posix"), RuntimeMode::Strict);
        assert_eq!(RuntimeMode::from_str_loose("reject"), RuntimeMode::Strict);
        assert_eq!(RuntimeMode::from_str_loose("bogus"), RuntimeMode::Compat);
    }

    #[test]
    fn default_is_compat() {
        assert_eq!(RuntimeMode::default(), RuntimeMode::Compat);
        assert!(RuntimeMode::Compat.external_unlock_allowed());
        assert!(!RuntimeMode::Strict.external_unlock_allowed());
    }

    #[test]
    fn resolve_cached_prefers_existing_value() {
        let cache = AtomicU8::new(7);
        let v = resolve_cached(&cache, "FRANKENPTHREAD_TEST_UNSET_VAR", |_| 3, 1);
        assert_eq!(v, 7);
    }

    #[test]
    fn resolve_cached_uses_fallback_without_env() {
        let cache = AtomicU8::new(0);
        let v = resolve_cached(&cache, "FRANKENPTHREAD_TEST_UNSET_VAR", |_| 3, 1);
        assert_eq!(v, 1);
        assert_eq!(cache.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn resolve_cached_reentrant_caller_gets_fallback() {
        let cache = AtomicU8::new(CACHE_RESOLVING);
        let v = resolve_cached(&cache, "FRANKENPTHREAD_TEST_UNSET_VAR", |_| 3, 1);
        assert_eq!(v, 1);
    }
}
