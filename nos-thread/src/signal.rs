//! Signal delivery and processing
//!
//! Foreign threads only ever set signal bits. The owning thread consumes
//! them at its preemption points through [`ThreadCore::check_signals`];
//! `KILL` stays set until the thread is dead.

use bitflags::bitflags;
use log::{debug, trace};
use nos_api::{KernelError, PolicyException, PolicyExceptionReport, Status, ThreadId, ThreadState};

use crate::lifecycle::KILLED_RETCODE;
use crate::lock::ThreadGuard;
use crate::thread::UserStateChange;
use crate::thread_core::ThreadCore;

bitflags! {
    /// Pending signal set of a thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Signals: u32 {
        /// Terminate at the next preemption point
        const KILL = 1 << 0;
        /// Stop at the next preemption point until resumed
        const SUSPEND = 1 << 1;
        /// Report a job policy violation to user space
        const POLICY_EXCEPTION = 1 << 2;
    }
}

/// A single pending signal, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSignal {
    Kill,
    PolicyException,
    Suspend,
}

impl Signals {
    /// Returns the signal to process first, if any
    pub fn next_pending(self) -> Option<PendingSignal> {
        if self.contains(Signals::KILL) {
            Some(PendingSignal::Kill)
        } else if self.contains(Signals::POLICY_EXCEPTION) {
            Some(PendingSignal::PolicyException)
        } else if self.contains(Signals::SUSPEND) {
            Some(PendingSignal::Suspend)
        } else {
            None
        }
    }

    /// Status an interruptable wait returns when these signals are pending.
    ///
    /// Policy exceptions do not interrupt waits.
    pub fn interrupt_status(self) -> Status {
        if self.contains(Signals::KILL) {
            Err(KernelError::InterruptedKilled)
        } else if self.contains(Signals::SUSPEND) {
            Err(KernelError::InterruptedRetry)
        } else {
            Ok(())
        }
    }
}

impl ThreadCore {
    /// Processes the calling thread's pending signals.
    ///
    /// Called at every safe preemption point, typically on the way back to
    /// user mode. A pending kill does not return.
    pub fn check_signals(&self) {
        let mut guard = self.lock();
        self.process_signals(&mut guard);
    }

    /// Flags a policy exception on `thread`; it is reported the next time the
    /// thread checks its signals
    pub fn raise_policy_exception(&self, thread: ThreadId, kind: PolicyException) -> Status {
        let mut guard = self.lock();
        let record = guard.state_mut().registry.lookup_mut(thread)?;
        if record.state == ThreadState::Death {
            return Err(KernelError::BadState);
        }
        record.signals.insert(Signals::POLICY_EXCEPTION);
        record.policy_exception = Some(kind);
        trace!("policy exception {:?} raised on {}", kind, thread);
        Ok(())
    }

    pub(crate) fn process_signals(&self, guard: &mut ThreadGuard<'_>) {
        let Some(current) = self.scheduler.current_thread() else {
            return;
        };

        loop {
            let thread = guard.state_mut().registry.record_mut(current);
            // Kill is sticky; once exit has started it must not recurse
            if thread.exiting {
                return;
            }

            match thread.signals.next_pending() {
                None => return,
                Some(PendingSignal::Kill) => {
                    debug!("{} processing kill", current);
                    guard.release();
                    self.exit(KILLED_RETCODE);
                }
                Some(PendingSignal::PolicyException) => {
                    thread.signals.remove(Signals::POLICY_EXCEPTION);
                    let kind = thread
                        .policy_exception
                        .take()
                        .unwrap_or(PolicyException::Other(0));
                    let report = PolicyExceptionReport {
                        thread: current,
                        kind,
                        timestamp: self.timer.now(),
                    };
                    guard.release();
                    self.dispatch_policy_exception(report);
                    guard.reacquire();
                }
                Some(PendingSignal::Suspend) => self.process_suspend(guard, current),
            }
        }
    }

    fn process_suspend(&self, guard: &mut ThreadGuard<'_>, current: ThreadId) {
        let callback = guard.state_mut().registry.record_mut(current).callback.clone();

        guard.release();
        if let Some(callback) = &callback {
            callback(current, UserStateChange::Suspend);
        }
        guard.reacquire();

        // A kill may have arrived while the lock was dropped
        self.exit_if_killed(guard, current);

        let now = self.timer.now();
        let thread = guard.state_mut().registry.record_mut(current);
        if thread.signals.contains(Signals::SUSPEND) {
            debug!("{} suspended", current);
            thread.leave_running(ThreadState::Suspended, now, self.config.time_slice_ns);
            guard.park();
            self.mark_running(guard, current);
            self.exit_if_killed(guard, current);
            debug!("{} resumed", current);
        }

        guard.release();
        if let Some(callback) = &callback {
            callback(current, UserStateChange::Resume);
        }
        guard.reacquire();
    }

    fn exit_if_killed(&self, guard: &mut ThreadGuard<'_>, current: ThreadId) {
        let thread = guard.state_mut().registry.record_mut(current);
        if thread.signals.contains(Signals::KILL) && !thread.exiting {
            guard.release();
            self.exit(KILLED_RETCODE);
        }
    }

    fn dispatch_policy_exception(&self, report: PolicyExceptionReport) {
        let port = self.exceptions.lock().clone();
        let Some(port) = port else {
            panic!(
                "policy exception {:?} on {} with no exception port",
                report.kind, report.thread
            );
        };
        if let Err(err) = port.dispatch(report) {
            panic!(
                "failed to dispatch policy exception on {}: {}",
                report.thread, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_takes_precedence() {
        let all = Signals::all();
        assert_eq!(all.next_pending(), Some(PendingSignal::Kill));
        assert_eq!(all.interrupt_status(), Err(KernelError::InterruptedKilled));
    }

    #[test]
    fn policy_exception_precedes_suspend_but_does_not_interrupt() {
        let signals = Signals::POLICY_EXCEPTION | Signals::SUSPEND;
        assert_eq!(signals.next_pending(), Some(PendingSignal::PolicyException));
        assert_eq!(signals.interrupt_status(), Err(KernelError::InterruptedRetry));
        assert_eq!(Signals::POLICY_EXCEPTION.interrupt_status(), Ok(()));
    }

    #[test]
    fn empty_set_has_nothing_pending() {
        assert_eq!(Signals::empty().next_pending(), None);
        assert_eq!(Signals::empty().interrupt_status(), Ok(()));
    }
}
