//! Error handling module for the NOS thread core
//!
//! Only runtime conditions a caller can react to are represented here.
//! Contract violations (corrupted records, destroying a busy wait queue,
//! exiting the idle thread) are fatal and never surface as a `KernelError`.

use core::fmt;

/// Status code returned by thread and wait-queue operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// The deadline passed before the operation could complete
    TimedOut,
    /// Operation is invalid for the current state of its target
    BadState,
    /// An argument is out of range or names nothing
    InvalidArgs,
    /// A blocking call was interrupted by a retryable signal (suspend)
    InterruptedRetry,
    /// A blocking call was interrupted because the thread is being killed
    InterruptedKilled,
    /// Allocation of a thread record or stack failed
    NoResources,
}

impl KernelError {
    /// Negative status code used at the syscall boundary
    pub const fn as_errno(self) -> i32 {
        match self {
            KernelError::NoResources => -4,
            KernelError::InvalidArgs => -10,
            KernelError::BadState => -20,
            KernelError::TimedOut => -21,
            KernelError::InterruptedRetry => -22,
            KernelError::InterruptedKilled => -502,
        }
    }

    /// Returns true for the two statuses that mean "a signal cut the wait short"
    pub const fn is_interrupt(self) -> bool {
        matches!(self, KernelError::InterruptedRetry | KernelError::InterruptedKilled)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::TimedOut => write!(f, "Operation timed out"),
            KernelError::BadState => write!(f, "Bad state"),
            KernelError::InvalidArgs => write!(f, "Invalid arguments"),
            KernelError::InterruptedRetry => write!(f, "Interrupted, retry"),
            KernelError::InterruptedKilled => write!(f, "Interrupted, thread killed"),
            KernelError::NoResources => write!(f, "No resources"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KernelError {}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, KernelError>;

/// Blocked-status carried by a thread and delivered by whoever wakes it
pub type Status = Result<()>;

/// Converts a status into the syscall-boundary code (`0` for success)
pub const fn status_to_errno(status: Status) -> i32 {
    match status {
        Ok(()) => 0,
        Err(err) => err.as_errno(),
    }
}
