//! Error number definitions.
//!
//! The subset of `<errno.h>` values the threading primitives report.

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ERANGE: i32 = 34;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const ENOTSUP: i32 = 95;
pub const ETIMEDOUT: i32 = 110;
pub const ECANCELED: i32 = 125;

/// Symbolic name of an errno value, for trace output.
#[must_use]
pub const fn name(errno: i32) -> &'static str {
    match errno {
        0 => "OK",
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EBUSY => "EBUSY",
        EINVAL => "EINVAL",
        ERANGE => "ERANGE",
        EDEADLK => "EDEADLK",
        ENOSYS => "ENOSYS",
        ENOTSUP => "ENOTSUP",
        ETIMEDOUT => "ETIMEDOUT",
        ECANCELED => "ECANCELED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_values() {
        assert_eq!(EPERM, 1);
        assert_eq!(EBUSY, 16);
        assert_eq!(EINVAL, 22);
        assert_eq!(EDEADLK, 35);
        assert_eq!(ETIMEDOUT, 110);
    }

    #[test]
    fn names_round_out_the_table() {
        assert_eq!(name(0), "OK");
        assert_eq!(name(EDEADLK), "EDEADLK");
        assert_eq!(name(ECANCELED), "ECANCELED");
        assert_eq!(name(-7), "UNKNOWN");
    }
}
