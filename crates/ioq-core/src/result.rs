//! Raw operation results.
//!
//! The kernel reports the outcome of every ring operation as a single
//! `i32`: non-negative values are byte counts or new file descriptors,
//! negative values are negated errno codes. [`IoResult`] keeps that
//! convention intact and adds typed accessors on top.

use std::fmt;
use std::io;

/// Result of a completed ring operation.
///
/// Non-negative means success (a byte count, a new fd, or zero); negative
/// is a negated POSIX error number.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IoResult(i32);

impl IoResult {
    /// Success with the given count.
    pub fn ok(count: u32) -> Self {
        Self(count as i32)
    }

    /// Failure with the given errno.
    pub fn from_errno(errno: i32) -> Self {
        debug_assert!(errno > 0);
        Self(-errno)
    }

    /// The raw kernel return value.
    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_ok(&self) -> bool {
        self.0 >= 0
    }

    /// The success value. Calling this on a failed result is a programming
    /// error and panics.
    pub fn value(&self) -> u32 {
        assert!(self.0 >= 0, "value() called on failed result: {}", self.0);
        self.0 as u32
    }

    /// The errno of a failed result, if any.
    pub fn errno(&self) -> Option<i32> {
        (self.0 < 0).then(|| -self.0)
    }

    /// The failure as an [`io::Error`]. Only meaningful when `!is_ok()`.
    pub fn error(&self) -> io::Error {
        io::Error::from_raw_os_error(-self.0)
    }

    pub fn into_result(self) -> io::Result<u32> {
        if self.0 >= 0 {
            Ok(self.0 as u32)
        } else {
            Err(io::Error::from_raw_os_error(-self.0))
        }
    }
}

impl Default for IoResult {
    // i32::MIN is not a valid errno, so a default-constructed result is
    // recognizably uninitialized.
    fn default() -> Self {
        Self(i32::MIN)
    }
}

impl From<i32> for IoResult {
    fn from(res: i32) -> Self {
        Self(res)
    }
}

impl fmt::Debug for IoResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 0 {
            write!(f, "IoResult::Ok({})", self.0)
        } else {
            write!(f, "IoResult::Err({})", self.error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_value() {
        let res = IoResult::from(42);
        assert!(res.is_ok());
        assert_eq!(res.value(), 42);
        assert_eq!(res.into_result().unwrap(), 42);
        assert_eq!(res.errno(), None);
    }

    #[test]
    fn failure_errno() {
        let res = IoResult::from(-libc::ECONNRESET);
        assert!(!res.is_ok());
        assert_eq!(res.errno(), Some(libc::ECONNRESET));
        assert_eq!(
            res.error().raw_os_error(),
            Some(libc::ECONNRESET)
        );
        assert!(res.into_result().is_err());
    }

    #[test]
    #[should_panic]
    fn value_on_failure_panics() {
        IoResult::from(-libc::EINVAL).value();
    }

    #[test]
    fn default_is_failed() {
        assert!(!IoResult::default().is_ok());
    }
}
