//! Error types for the allocator

use core::fmt;

/// Errors that can occur during allocation operations
///
/// Only `OutOfMemory` ever reaches a caller (as a null pointer from the
/// public API); everything else indicates a broken internal invariant and
/// is routed through [`die`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The page provider could not satisfy a mapping request
    OutOfMemory,
    /// The thread id space has been exhausted
    ThreadIdsExhausted,
    /// A freed pointer does not belong to this allocator
    UnknownPointer,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::ThreadIdsExhausted => write!(f, "thread id space exhausted"),
            Self::UnknownPointer => write!(f, "pointer not owned by this allocator"),
        }
    }
}

/// Abort the process with a diagnostic.
///
/// Invariant breaches (bitmap desync, buddy mismatch, garbage stack shape)
/// are bugs, not recoverable conditions. There is no per-call error channel
/// for them.
#[cold]
pub fn die(msg: &str) -> ! {
    log::error!("fatal allocator invariant breach: {msg}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(AllocError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            AllocError::UnknownPointer.to_string(),
            "pointer not owned by this allocator"
        );
    }
}
