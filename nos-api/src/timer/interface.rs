//! One-shot timer interface used for sleeps and wait timeouts

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::core::types::{Deadline, Nanoseconds};

/// Handle of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Wraps a raw handle value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Window within which the timer may fire late so wake-ups can be batched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimerSlack {
    /// Allowed lateness in nanoseconds
    pub amount: Nanoseconds,
}

impl TimerSlack {
    /// Fire as close to the deadline as possible
    pub const NONE: TimerSlack = TimerSlack { amount: 0 };

    /// Slack of `amount` nanoseconds
    pub const fn new(amount: Nanoseconds) -> Self {
        Self { amount }
    }
}

/// Context passed to a firing timer callback
pub struct TimerEvent<'a> {
    /// Time the timer fired
    pub now: Nanoseconds,
    canceled: &'a AtomicBool,
}

impl<'a> TimerEvent<'a> {
    /// Builds the event for a firing timer whose cancel flag is `canceled`
    pub fn new(now: Nanoseconds, canceled: &'a AtomicBool) -> Self {
        Self { now, canceled }
    }

    /// Returns true once someone has canceled the firing timer.
    ///
    /// Callbacks that spin on a lock poll this so they never deadlock
    /// against the CPU that holds the lock and is canceling them.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Callback run when a timer fires, possibly in interrupt context
pub type TimerCallback = Box<dyn FnOnce(&TimerEvent<'_>) + Send + 'static>;

/// Trait for the timer wheel
pub trait TimerQueue: Send + Sync {
    /// Current monotonic time
    fn now(&self) -> Nanoseconds;

    /// Arms a one-shot timer
    fn arm(&self, deadline: Deadline, slack: TimerSlack, callback: TimerCallback) -> TimerHandle;

    /// Cancels a timer. Returns true if it was still pending.
    ///
    /// Canceling a timer that already fired or was never armed is a no-op.
    fn cancel(&self, timer: TimerHandle) -> bool;
}
