//! Process-side collaborator interfaces
//!
//! The thread core never schedules anything itself. It marks threads
//! runnable or parked and hands them to a [`SchedulerBridge`]; the bridge
//! decides when they actually run.

use alloc::boxed::Box;
use core::fmt;

use crate::core::types::{CpuId, ThreadId};
use crate::error::Result;
use crate::process::types::{IrqState, PolicyExceptionReport};

/// Entry trampoline handed to the scheduler on a thread's first admission.
///
/// The trampoline ends by exiting the thread, so once called it does not
/// return control to the bridge in a real kernel.
pub type ThreadStart = Box<dyn FnOnce() + Send + 'static>;

/// The global thread lock, still held by a dead thread making its final switch.
///
/// Nothing can free the thread's stack while the lock is held. The bridge
/// completes the handoff once that stack is no longer in use; dropping it
/// completes it as well.
pub struct ExitHandoff {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ExitHandoff {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Releases the lock
    pub fn complete(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ExitHandoff {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for ExitHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHandoff")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// Trait for the run-queue scheduler the thread core feeds
pub trait SchedulerBridge: Send + Sync {
    /// Returns the thread executing on the calling CPU, if any
    fn current_thread(&self) -> Option<ThreadId>;

    /// Returns the calling CPU
    fn current_cpu(&self) -> CpuId;

    /// Admits a thread that has never run; `entry` runs on its new context
    fn start(&self, thread: ThreadId, entry: ThreadStart);

    /// Records that the calling context now runs as `thread` (boot thread)
    fn adopt_current(&self, _thread: ThreadId) {}

    /// Hands a thread that is not running back to the scheduler as runnable.
    ///
    /// A `make_ready` that arrives before the matching [`block_current`]
    /// must not be lost: the park then returns immediately.
    ///
    /// [`block_current`]: SchedulerBridge::block_current
    fn make_ready(&self, thread: ThreadId);

    /// Hands a batch of threads to the scheduler in one step
    fn make_ready_batch(&self, threads: &[ThreadId]) {
        for &thread in threads {
            self.make_ready(thread);
        }
    }

    /// Parks the calling thread, already marked not running, until woken
    fn block_current(&self);

    /// Gives up the rest of the quantum and returns when picked again
    fn reschedule(&self);

    /// Cooperative relinquishment of the current quantum
    fn yield_current(&self);

    /// Forced relinquishment of the current quantum
    fn preempt_current(&self);

    /// Final switch away from a dead thread. Never resumes the caller.
    ///
    /// Called with the global thread lock held. The bridge completes
    /// `handoff` from the next context, once it is off the dead thread's
    /// stack.
    fn exit_current(&self, handoff: ExitHandoff);

    /// Wakes the worker context that runs deferred reclaim jobs.
    ///
    /// Called with the global thread lock held; it must only signal.
    fn schedule_reclaim(&self) {}

    /// Nudges another CPU so a thread running there notices a new signal
    fn send_reschedule_ipi(&self, cpu: CpuId);

    /// Disables local interrupts and returns the previous state
    fn disable_interrupts(&self) -> IrqState {
        IrqState::default()
    }

    /// Restores the interrupt state saved by [`disable_interrupts`]
    ///
    /// [`disable_interrupts`]: SchedulerBridge::disable_interrupts
    fn restore_interrupts(&self, _state: IrqState) {}
}

/// Trait for the channel that delivers policy exceptions to user space
pub trait ExceptionPort: Send + Sync {
    /// Delivers the report; an error here is fatal for the kernel
    fn dispatch(&self, report: PolicyExceptionReport) -> Result<()>;
}
