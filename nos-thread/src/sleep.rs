//! Timed sleeps and timeout expiry

use core::hint;

use log::{trace, warn};
use nos_api::{
    Deadline, KernelError, Nanoseconds, Status, ThreadId, ThreadState, TimerEvent, TimerSlack,
    NSEC_PER_SEC, NSEC_PER_USEC,
};

use crate::lock::ThreadGuard;
use crate::thread_core::ThreadCore;

/// Smallest slack a timed sleep is given
const MIN_SLACK: Nanoseconds = NSEC_PER_USEC;

/// Largest slack a timed sleep is given
const MAX_SLACK: Nanoseconds = NSEC_PER_SEC;

/// Timer slack for a sleep ending at `deadline`: a tenth of the remaining
/// time, clamped to 1us..=1s
pub fn compute_slack(now: Nanoseconds, deadline: Deadline) -> TimerSlack {
    if deadline.is_infinite() {
        return TimerSlack::NONE;
    }
    let amount = deadline.remaining(now) / 10;
    TimerSlack::new(amount.clamp(MIN_SLACK, MAX_SLACK))
}

impl ThreadCore {
    /// Sleeps the calling thread until `deadline`.
    ///
    /// Returns `TimedOut` when the deadline is reached, including when it has
    /// already passed on entry. An interruptable sleep returns early with the
    /// interrupt status of a pending or arriving signal.
    pub fn sleep(&self, deadline: Deadline, interruptable: bool) -> Status {
        let mut guard = self.lock();
        self.sleep_locked(&mut guard, deadline, interruptable)
    }

    /// Sleeps for `delay` nanoseconds from now
    pub fn sleep_for(&self, delay: Nanoseconds, interruptable: bool) -> Status {
        let deadline = Deadline::after(self.timer.now(), delay);
        self.sleep(deadline, interruptable)
    }

    pub(crate) fn sleep_locked(
        &self,
        guard: &mut ThreadGuard<'_>,
        deadline: Deadline,
        interruptable: bool,
    ) -> Status {
        let current = self.require_current();
        let now = self.timer.now();

        let thread = guard.state_mut().registry.record_mut(current);
        if thread.state != ThreadState::Running {
            panic!("{} slept while {}", current, thread.state);
        }
        if deadline.has_passed(now) {
            return Err(KernelError::TimedOut);
        }
        if interruptable {
            thread.signals.interrupt_status()?;
        }

        let generation = thread.wait.begin(None, interruptable);
        thread.leave_running(ThreadState::Sleeping, now, self.config.time_slice_ns);
        if !deadline.is_infinite() {
            let slack = compute_slack(now, deadline);
            thread.wait.timer = Some(self.arm_timeout(current, generation, deadline, slack));
        }
        trace!("{} sleeping until {}", current, deadline);

        guard.park();
        self.finish_wait(guard, current)
    }

    /// Completes a wait once the thread is scheduled again: back to
    /// `Running`, timer canceled, delivered status returned
    pub(crate) fn finish_wait(&self, guard: &mut ThreadGuard<'_>, current: ThreadId) -> Status {
        self.mark_running(guard, current);
        let wait = &mut guard.state_mut().registry.record_mut(current).wait;
        let status = wait.status;
        if let Some(timer) = wait.timer.take() {
            // The timer may already have fired; canceling it then is a no-op
            self.timer.cancel(timer);
        }
        status
    }

    /// Timer callback for wait number `generation` of `thread`
    pub(crate) fn handle_timeout(&self, thread: ThreadId, generation: u64, event: &TimerEvent<'_>) {
        // The CPU holding the lock may be canceling this very timer
        let mut guard = loop {
            if event.is_canceled() {
                return;
            }
            if let Some(guard) = self.try_lock() {
                break guard;
            }
            hint::spin_loop();
        };

        let state = guard.state_mut();
        let Some(record) = state.registry.get_mut(thread) else {
            warn!("timeout fired for freed thread {}", thread);
            return;
        };
        if record.wait.generation != generation {
            trace!("stale timeout for {} ignored", thread);
            return;
        }

        match record.state {
            ThreadState::Blocked => {
                // A dequeued thread belongs to whoever dequeued it
                let Some(queue) = record.wait.queue else {
                    return;
                };
                state.queues.remove(queue, thread);
                trace!("{} timed out on {}", thread, queue);
            }
            ThreadState::Sleeping => trace!("{} woke at {}", thread, event.now),
            _ => return,
        }

        state.ready_with_status(thread, Err(KernelError::TimedOut));
        self.scheduler.make_ready(thread);
    }
}
