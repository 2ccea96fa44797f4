//! Error types for the strand runtime

use thiserror::Error;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations.
///
/// Timeouts, interrupts and closed-fd conditions surface through the shims'
/// return value and errno, matching the syscall contracts; only conditions
/// with no errno channel appear here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The direction is already registered on this fd
    #[error("event already registered on fd {0}")]
    AlreadyRegistered(i32),

    /// The readiness notifier rejected a control operation
    #[error("readiness notifier failure: errno {0}")]
    KernelFailure(i32),

    /// Stack allocation failed
    #[error("stack error: {0}")]
    Stack(#[from] StackError),

    /// Platform call failed with the given errno
    #[error("platform error: errno {0}")]
    Platform(i32),
}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// mmap failed
    #[error("stack allocation failed: errno {0}")]
    AllocationFailed(i32),

    /// mprotect on the guard page failed
    #[error("guard page protection failed: errno {0}")]
    ProtectionFailed(i32),

    /// Requested size too small to hold a frame
    #[error("stack size {0} too small")]
    TooSmall(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RuntimeError::AlreadyRegistered(7).to_string(),
            "event already registered on fd 7"
        );
        assert_eq!(
            RuntimeError::KernelFailure(9).to_string(),
            "readiness notifier failure: errno 9"
        );
    }

    #[test]
    fn test_stack_error_conversion() {
        let e: RuntimeError = StackError::TooSmall(16).into();
        assert!(matches!(e, RuntimeError::Stack(StackError::TooSmall(16))));
    }
}
