//! Thread core configuration

use nos_api::{KernelError, Nanoseconds, Result, NSEC_PER_MSEC};
use static_assertions::const_assert;

/// Lowest schedulable priority
pub const LOWEST_PRIORITY: u8 = 0;

/// Highest schedulable priority
pub const HIGHEST_PRIORITY: u8 = 31;

/// Priority of a thread whose creator asked for none
pub const DEFAULT_PRIORITY: u8 = 16;

/// Maximum number of threads system-wide
pub const MAX_THREADS: usize = 1024;

/// Default thread stack size
pub const DEFAULT_THREAD_STACK_SIZE: usize = 8192;

/// Largest stack the core will allocate on a caller's behalf
pub const MAX_THREAD_STACK_SIZE: usize = 1024 * 1024;

/// Freed stacks kept around for reuse
pub const DEFAULT_STACK_POOL_LIMIT: usize = 64;

/// Initial time slice handed to a new thread
pub const DEFAULT_TIME_SLICE: Nanoseconds = 10 * NSEC_PER_MSEC;

const_assert!(LOWEST_PRIORITY < DEFAULT_PRIORITY);
const_assert!(DEFAULT_PRIORITY <= HIGHEST_PRIORITY);
const_assert!(DEFAULT_THREAD_STACK_SIZE <= MAX_THREAD_STACK_SIZE);

/// Tunables of a [`ThreadCore`](crate::ThreadCore)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadConfig {
    /// Live thread records; creation beyond this fails with `NoResources`
    pub max_threads: usize,
    /// Size of a stack the core allocates when the creator supplies none
    pub default_stack_size: usize,
    /// Upper bound for requested stack sizes
    pub max_stack_size: usize,
    /// Freed default-size stacks kept for reuse
    pub stack_pool_limit: usize,
    /// Base priority of threads created without one
    pub default_priority: u8,
    /// Time slice a thread starts with and is refilled to
    pub time_slice_ns: Nanoseconds,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_THREADS,
            default_stack_size: DEFAULT_THREAD_STACK_SIZE,
            max_stack_size: MAX_THREAD_STACK_SIZE,
            stack_pool_limit: DEFAULT_STACK_POOL_LIMIT,
            default_priority: DEFAULT_PRIORITY,
            time_slice_ns: DEFAULT_TIME_SLICE,
        }
    }
}

impl ThreadConfig {
    /// Rejects configurations the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(KernelError::InvalidArgs);
        }
        if self.default_stack_size == 0 || self.default_stack_size > self.max_stack_size {
            return Err(KernelError::InvalidArgs);
        }
        if self.default_priority > HIGHEST_PRIORITY {
            return Err(KernelError::InvalidArgs);
        }
        if self.time_slice_ns == 0 {
            return Err(KernelError::InvalidArgs);
        }
        Ok(())
    }
}
