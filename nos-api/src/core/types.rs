//! Core types used throughout the NOS thread core

use core::fmt;

/// Process identifier type
pub type Pid = u32;

/// CPU identifier type
pub type CpuId = u32;

/// Time in nanoseconds
pub type Nanoseconds = u64;

/// Nanoseconds per microsecond
pub const NSEC_PER_USEC: Nanoseconds = 1_000;

/// Nanoseconds per millisecond
pub const NSEC_PER_MSEC: Nanoseconds = 1_000_000;

/// Nanoseconds per second
pub const NSEC_PER_SEC: Nanoseconds = 1_000_000_000;

/// Relative delay that never expires
pub const INFINITE_DELAY: Nanoseconds = Nanoseconds::MAX;

/// Stable identifier of a thread record.
///
/// Identifiers are handed out from a monotonically increasing counter and are
/// never reused, so a stale id can always be told apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Wraps a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Absolute point in monotonic time after which a blocking call gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Nanoseconds);

impl Deadline {
    /// A deadline that never expires; no timer is armed for it
    pub const INFINITE: Deadline = Deadline(Nanoseconds::MAX);

    /// Deadline at an absolute time
    pub const fn at(nanos: Nanoseconds) -> Self {
        Self(nanos)
    }

    /// Deadline `delay` nanoseconds after `now`.
    ///
    /// [`INFINITE_DELAY`] maps to [`Deadline::INFINITE`] instead of being added
    /// to `now`; any other overflow saturates to the same sentinel.
    pub const fn after(now: Nanoseconds, delay: Nanoseconds) -> Self {
        if delay == INFINITE_DELAY {
            Self::INFINITE
        } else {
            Self(now.saturating_add(delay))
        }
    }

    /// Absolute expiry time in nanoseconds
    pub const fn as_nanos(self) -> Nanoseconds {
        self.0
    }

    /// Returns true for the never-expiring sentinel
    pub const fn is_infinite(self) -> bool {
        self.0 == Nanoseconds::MAX
    }

    /// Returns true when the deadline is at or before `now`
    pub const fn has_passed(self, now: Nanoseconds) -> bool {
        !self.is_infinite() && self.0 <= now
    }

    /// Nanoseconds left until expiry, zero if already passed
    pub const fn remaining(self, now: Nanoseconds) -> Nanoseconds {
        self.0.saturating_sub(now)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "infinite")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// Represents a thread state
///
/// Exactly one state holds at any instant and it only changes while the
/// global thread lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Created but not yet admitted to the scheduler
    Initial,
    /// Runnable, waiting for a CPU
    Ready,
    /// Executing on a CPU
    Running,
    /// Parked on a wait queue
    Blocked,
    /// Parked on a timer
    Sleeping,
    /// Stopped by a suspend signal until resumed
    Suspended,
    /// Terminal; resources are awaiting reclamation
    Death,
}

impl ThreadState {
    /// Every state, in declaration order
    pub const ALL: [ThreadState; 7] = [
        ThreadState::Initial,
        ThreadState::Ready,
        ThreadState::Running,
        ThreadState::Blocked,
        ThreadState::Sleeping,
        ThreadState::Suspended,
        ThreadState::Death,
    ];

    /// Returns true for the states a thread can only enter from `Running`
    pub const fn is_parked(self) -> bool {
        matches!(self, Self::Blocked | Self::Sleeping | Self::Suspended)
    }

    /// Short upper-case label used by the registry dump
    pub const fn label(self) -> &'static str {
        match self {
            Self::Initial => "INIT",
            Self::Ready => "RDY",
            Self::Running => "RUN",
            Self::Blocked => "BLOCK",
            Self::Sleeping => "SLEEP",
            Self::Suspended => "SUSP",
            Self::Death => "DEATH",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
