//! Error types for queue and allocator operations.
//!
//! Only genuinely recoverable conditions are represented here. A failed
//! allocation leaves the queue observably unchanged, so the caller may
//! retry or give up. Precondition violations (committing a transaction
//! twice, reading a typed element with the wrong type) are programming
//! errors and panic instead.

use thiserror::Error;

/// Errors returned by queue and allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The system could not supply backing memory for a page or an
    /// oversized payload.
    #[error("out of memory")]
    OutOfMemory,

    /// The operation could not complete under the requested progress
    /// guarantee. This is a signal, not a failure: the queue is
    /// unchanged and the call may be repeated.
    #[error("operation would block under the requested progress guarantee")]
    WouldBlock,
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::OutOfMemory.to_string(), "out of memory");
        assert!(Error::WouldBlock.to_string().contains("would block"));
    }

    #[test]
    fn test_error_is_copy_eq() {
        let e = Error::OutOfMemory;
        let f = e;
        assert_eq!(e, f);
        assert_ne!(e, Error::WouldBlock);
    }
}
