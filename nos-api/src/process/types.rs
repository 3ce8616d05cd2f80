//! Types exchanged between the thread core and its process-side collaborators

use crate::core::types::{Nanoseconds, ThreadId};

/// Interrupt state saved when the global thread lock is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqState {
    /// Whether interrupts were enabled before they were disabled
    pub were_enabled: bool,
}

/// Job policy violations reported to user space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyException {
    /// A syscall denied by the job policy was attempted
    DeniedSyscall,
    /// A handle operation violated the job policy
    BadHandle,
    /// Any other policy violation, tagged with its raw code
    Other(u32),
}

/// Report handed to the exception port when a policy exception is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyExceptionReport {
    /// Thread that raised the exception
    pub thread: ThreadId,
    /// What went wrong
    pub kind: PolicyException,
    /// Monotonic time the report was built
    pub timestamp: Nanoseconds,
}
