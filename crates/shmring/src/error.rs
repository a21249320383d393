//! Error types for channel operations.

use std::io;
use thiserror::Error;

/// Errors that can occur on a channel or ring operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The channel has been torn down by either side.
    ///
    /// Terminal: every subsequent operation on this channel returns the
    /// same.
    #[error("channel is closed")]
    Closed,

    /// The framed message cannot fit the ring even when empty.
    ///
    /// Unrecoverable for this message; the channel itself remains usable.
    #[error("message of {len} bytes exceeds ring capacity {capacity}")]
    TooBig {
        /// Requested payload length in bytes.
        len: usize,
        /// Capacity of the ring the message was pushed into.
        capacity: usize,
    },

    /// No data to pop, or not enough free space to push.
    ///
    /// Transient backpressure: retry, or use a blocking variant.
    #[error("ring is busy (no data or no space)")]
    Busy,

    /// A timed blocking operation expired before the condition held.
    #[error("operation timed out")]
    Timeout,

    /// Caller misuse: bad argument or operation on invalid state.
    #[error("invalid argument or state: {0}")]
    Invalid(&'static str),

    /// The host OS has no usable wait-on-address primitive.
    #[error("wait-on-address is not supported on this platform")]
    Unsupported,

    /// A syscall failed; the underlying errno is preserved.
    #[error("system error: {0}")]
    System(#[from] io::Error),
}

impl Error {
    /// Returns `true` for transient backpressure that a retry can clear.
    #[inline]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Returns `true` if the channel is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Unsupported)
    }

    /// Stable integer code for logs and FFI-style consumers.
    ///
    /// The first five values match the original wire protocol's C API
    /// (`OK`/`FAIL`/`TOOBIG`/`BUSY`/`TIMEOUT`); the rest extend the set.
    pub fn code(&self) -> i32 {
        match self {
            Self::System(_) => -1,
            Self::TooBig { .. } => -2,
            Self::Busy => -3,
            Self::Timeout => -4,
            Self::Closed => -5,
            Self::Invalid(_) => -6,
            Self::Unsupported => -7,
        }
    }

    /// Shorthand for wrapping the current `errno`.
    pub(crate) fn last_os_error() -> Self {
        Self::System(io::Error::last_os_error())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::System(io::Error::from_raw_os_error(13)).code(), -1);
        assert_eq!(Error::TooBig { len: 9, capacity: 8 }.code(), -2);
        assert_eq!(Error::Busy.code(), -3);
        assert_eq!(Error::Timeout.code(), -4);
        assert_eq!(Error::Closed.code(), -5);
        assert_eq!(Error::Invalid("x").code(), -6);
        assert_eq!(Error::Unsupported.code(), -7);
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Busy.is_busy());
        assert!(!Error::Timeout.is_busy());
        assert!(Error::Closed.is_terminal());
        assert!(Error::Unsupported.is_terminal());
        assert!(!Error::Busy.is_terminal());
    }
}
