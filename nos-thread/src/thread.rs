// Thread records for the NOS thread core
//
// A thread record is the state machine, signal mask and resource-ownership
// record of one schedulable unit. Records live in the registry arena and are
// only touched with the global thread lock held.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt::Write;

use bitflags::bitflags;
use nos_api::{
    CpuId, Nanoseconds, Pid, PolicyException, Status, ThreadId, ThreadState, TimerHandle,
};

use crate::config::{HIGHEST_PRIORITY, LOWEST_PRIORITY};
use crate::signal::Signals;
use crate::stack::KernelStack;
use crate::wait_queue::{WaitQueue, WaitQueueId};

// ============================================================================
// Constants and Types
// ============================================================================

/// Tag stored in every live thread record ("thrd")
pub(crate) const THREAD_MAGIC: u32 = 0x7468_7264;

/// Maximum length of a thread name in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Fixed-capacity thread name
pub type ThreadName = heapless::String<MAX_NAME_LEN>;

/// Body of a thread; its return value becomes the thread's retcode
pub type ThreadEntry = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// User-state transitions reported to the owning process layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStateChange {
    /// The thread is about to stop for a suspend request
    Suspend,
    /// The thread is running again after a suspend
    Resume,
    /// The thread is about to exit
    Exit,
}

/// Callback told about user-state transitions; always invoked with the
/// global thread lock released
pub type UserStateCallback = Arc<dyn Fn(ThreadId, UserStateChange) + Send + Sync + 'static>;

bitflags! {
    /// Thread flags and attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Resources are reclaimed at exit instead of by a join
        const DETACHED = 1 << 0;
        /// Per-CPU idle thread; never suspended, killed or exited
        const IDLE = 1 << 1;
        /// The core allocated the stack and frees it at reclamation
        const STACK_OWNED = 1 << 2;
        /// Adopted boot context rather than a created thread
        const BOOT = 1 << 3;
    }
}

/// Truncates `name` to [`MAX_NAME_LEN`] bytes on a character boundary
pub fn make_name(name: &str) -> ThreadName {
    let mut out = ThreadName::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Format a name for a thread that did not get one
pub(crate) fn anonymous_name(id: ThreadId) -> ThreadName {
    let mut out = ThreadName::new();
    let _ = write!(out, "thread-{}", id.as_u64());
    out
}

// ============================================================================
// Scheduling attributes
// ============================================================================

/// Scheduling information owned by the thread and consulted by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttrs {
    /// Priority the thread was created or configured with
    pub base_priority: u8,
    /// Transient boost added on top of the base priority
    pub priority_boost: i8,
    /// CPU the thread is pinned to, if any
    pub pinned_cpu: Option<CpuId>,
    /// CPU the thread last ran on
    pub last_cpu: Option<CpuId>,
    /// Remaining time slice
    pub remaining_slice: Nanoseconds,
    /// Accumulated time spent `Running`
    pub runtime: Nanoseconds,
}

impl SchedAttrs {
    pub(crate) fn new(base_priority: u8, time_slice: Nanoseconds) -> Self {
        Self {
            base_priority,
            priority_boost: 0,
            pinned_cpu: None,
            last_cpu: None,
            remaining_slice: time_slice,
            runtime: 0,
        }
    }

    /// Get effective priority (base plus boost, kept inside the valid range)
    pub fn effective_priority(&self) -> u8 {
        let prio = i16::from(self.base_priority) + i16::from(self.priority_boost);
        prio.clamp(i16::from(LOWEST_PRIORITY), i16::from(HIGHEST_PRIORITY)) as u8
    }
}

// ============================================================================
// Wait linkage
// ============================================================================

/// What a parked thread is waiting on and how it was woken
#[derive(Debug)]
pub(crate) struct WaitLink {
    /// Queue the thread is enqueued in; `None` unless `Blocked`
    pub(crate) queue: Option<WaitQueueId>,
    /// Status delivered by whoever wakes the thread
    pub(crate) status: Status,
    /// Whether signals may cut the current wait short
    pub(crate) interruptable: bool,
    /// Bumped at the start of every wait so stale timers can be told apart
    pub(crate) generation: u64,
    /// Timeout armed for the current wait
    pub(crate) timer: Option<TimerHandle>,
}

impl WaitLink {
    fn new() -> Self {
        Self {
            queue: None,
            status: Ok(()),
            interruptable: false,
            generation: 0,
            timer: None,
        }
    }

    /// Starts a new wait and returns its generation
    pub(crate) fn begin(&mut self, queue: Option<WaitQueueId>, interruptable: bool) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.queue = queue;
        self.status = Ok(());
        self.interruptable = interruptable;
        self.timer = None;
        self.generation
    }
}

// ============================================================================
// Thread control block
// ============================================================================

/// Thread control block
pub(crate) struct Thread {
    /// Corruption-detection tag
    pub(crate) magic: u32,
    /// Thread ID
    pub(crate) id: ThreadId,
    pub(crate) name: ThreadName,
    /// Owning process, for debug display only
    pub(crate) process: Option<Pid>,
    pub(crate) state: ThreadState,
    pub(crate) flags: ThreadFlags,
    pub(crate) signals: Signals,
    /// Kind of the pending policy exception, set together with its signal
    pub(crate) policy_exception: Option<PolicyException>,
    /// Set once exit has started; guards against recursive exit
    pub(crate) exiting: bool,
    pub(crate) sched: SchedAttrs,
    /// When the thread last became `Running`
    pub(crate) running_since: Option<Nanoseconds>,
    pub(crate) wait: WaitLink,
    /// Valid once the state is `Death`
    pub(crate) retcode: i32,
    /// Threads waiting for this one to die
    pub(crate) joiners: WaitQueue,
    pub(crate) stack: Option<KernelStack>,
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) callback: Option<UserStateCallback>,
    pub(crate) created_at: Nanoseconds,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: ThreadName, sched: SchedAttrs, now: Nanoseconds) -> Self {
        Self {
            magic: THREAD_MAGIC,
            id,
            name,
            process: None,
            state: ThreadState::Initial,
            flags: ThreadFlags::empty(),
            signals: Signals::empty(),
            policy_exception: None,
            exiting: false,
            sched,
            running_since: None,
            wait: WaitLink::new(),
            retcode: 0,
            joiners: WaitQueue::new(),
            stack: None,
            entry: None,
            callback: None,
            created_at: now,
        }
    }

    /// Aborts on a corrupted record
    pub(crate) fn check_magic(&self) {
        if self.magic != THREAD_MAGIC {
            panic!(
                "thread record {} corrupted: magic {:#x}",
                self.id, self.magic
            );
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.flags.contains(ThreadFlags::DETACHED)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    /// Enter `Running` on `cpu` at `now`
    pub(crate) fn set_running(&mut self, cpu: CpuId, now: Nanoseconds) {
        self.state = ThreadState::Running;
        self.sched.last_cpu = Some(cpu);
        self.running_since = Some(now);
    }

    /// Leave `Running` for `state`, charging the time spent running
    pub(crate) fn leave_running(&mut self, state: ThreadState, now: Nanoseconds, time_slice: Nanoseconds) {
        if let Some(since) = self.running_since.take() {
            let ran = now.saturating_sub(since);
            self.sched.runtime = self.sched.runtime.saturating_add(ran);
            self.sched.remaining_slice = self.sched.remaining_slice.saturating_sub(ran);
            if self.sched.remaining_slice == 0 {
                self.sched.remaining_slice = time_slice;
            }
        }
        self.state = state;
    }
}

static_assertions::assert_impl_all!(Thread: Send);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        assert_eq!(make_name(long).len(), MAX_NAME_LEN);
        let wide = "ééééééééééééééééééé"; // 19 two-byte chars
        let name = make_name(wide);
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn effective_priority_is_clamped() {
        let mut attrs = SchedAttrs::new(30, 10);
        attrs.priority_boost = 5;
        assert_eq!(attrs.effective_priority(), HIGHEST_PRIORITY);
        attrs.base_priority = 2;
        attrs.priority_boost = -5;
        assert_eq!(attrs.effective_priority(), LOWEST_PRIORITY);
        attrs.priority_boost = 3;
        assert_eq!(attrs.effective_priority(), 5);
    }

    #[test]
    fn leaving_running_charges_runtime_and_refills_slice() {
        let mut thread = Thread::new(ThreadId::new(1), make_name("t"), SchedAttrs::new(16, 100), 0);
        thread.set_running(0, 1_000);
        thread.leave_running(ThreadState::Ready, 1_040, 100);
        assert_eq!(thread.sched.runtime, 40);
        assert_eq!(thread.sched.remaining_slice, 60);

        thread.set_running(1, 2_000);
        thread.leave_running(ThreadState::Blocked, 2_060, 100);
        assert_eq!(thread.sched.runtime, 100);
        assert_eq!(thread.sched.remaining_slice, 100);
        assert_eq!(thread.sched.last_cpu, Some(1));
        assert_eq!(thread.state, ThreadState::Blocked);
    }

    #[test]
    fn new_wait_bumps_generation() {
        let mut link = WaitLink::new();
        link.status = Err(nos_api::KernelError::TimedOut);
        let first = link.begin(None, true);
        let second = link.begin(None, false);
        assert_eq!(second, first + 1);
        assert_eq!(link.status, Ok(()));
        assert!(!link.interruptable);
    }
}
