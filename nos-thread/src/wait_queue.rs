//! Wait queues
//!
//! A wait queue is an ordered set of blocked threads. The queue object
//! itself is only a handle; membership lives in the [`QueueTable`] inside
//! the lock-protected kernel state, keyed by [`WaitQueueId`]. Every member
//! is `Blocked` and its wait link names the queue it sits in.
//!
//! Wake order within one queue is strictly FIFO.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use log::trace;
use nos_api::sync::{AtomicU32, AtomicU64, Ordering};
use nos_api::{Deadline, KernelError, Status, ThreadId, ThreadState, TimerSlack};

use crate::lifecycle::Relinquish;
use crate::lock::ThreadGuard;
use crate::registry::KernelState;

/// Tag stored in every live wait queue ("wait")
const WAIT_QUEUE_MAGIC: u32 = 0x7761_6974;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a wait queue inside the queue table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitQueueId(u64);

impl WaitQueueId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaitQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wq:{}", self.0)
    }
}

// ============================================================================
// Queue handle
// ============================================================================

/// Handle of a FIFO wait queue.
///
/// All operations take the [`ThreadGuard`], so queue membership can only
/// change with the global thread lock held. A queue must be empty when it is
/// destroyed.
pub struct WaitQueue {
    magic: AtomicU32,
    id: WaitQueueId,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            magic: AtomicU32::new(WAIT_QUEUE_MAGIC),
            id: WaitQueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn id(&self) -> WaitQueueId {
        self.check_magic();
        self.id
    }

    fn check_magic(&self) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != WAIT_QUEUE_MAGIC {
            panic!("wait queue {} corrupted: magic {:#x}", self.id, magic);
        }
    }

    /// Blocks the calling thread on this queue until it is woken, the
    /// deadline passes or, if `interruptable`, a signal arrives.
    ///
    /// Returns the status delivered by the waker.
    pub fn block(&self, guard: &mut ThreadGuard<'_>, deadline: Deadline, interruptable: bool) -> Status {
        guard.block_on(self.id(), deadline, interruptable)
    }

    /// Wakes the longest waiter with `status`. Returns the number woken.
    pub fn wake_one(&self, guard: &mut ThreadGuard<'_>, reschedule: bool, status: Status) -> usize {
        guard.wake_one_on(self.id(), reschedule, status)
    }

    /// Wakes every waiter, in FIFO order, with `status`
    pub fn wake_all(&self, guard: &mut ThreadGuard<'_>, reschedule: bool, status: Status) -> usize {
        guard.wake_all_on(self.id(), reschedule, status)
    }

    /// Takes the longest waiter off the queue without making it runnable.
    ///
    /// The thread stays `Blocked` until the returned token is handed to
    /// [`ThreadGuard::make_ready_dequeued`] or [`ThreadGuard::requeue`].
    pub fn dequeue_one(&self, guard: &mut ThreadGuard<'_>, status: Status) -> Option<Dequeued> {
        let id = self.id();
        let state = guard.state_mut();
        let thread = state.queues.pop_front(id)?;
        let record = state.registry.record_mut(thread);
        record.wait.queue = None;
        record.wait.status = status;
        trace!("{} dequeued from {}", thread, id);
        Some(Dequeued { thread })
    }

    /// Number of threads blocked on this queue
    pub fn count(&self, guard: &ThreadGuard<'_>) -> usize {
        guard.state().queues.len(self.id())
    }

    pub fn is_empty(&self, guard: &ThreadGuard<'_>) -> bool {
        self.count(guard) == 0
    }

    /// Destroys the queue; any later use of the handle is fatal.
    ///
    /// # Panics
    ///
    /// Panics if any thread is still blocked on it.
    pub fn destroy(&self, guard: &ThreadGuard<'_>) {
        let id = self.id();
        let waiters = guard.state().queues.len(id);
        if waiters != 0 {
            panic!("wait queue {} destroyed with {} waiters", id, waiters);
        }
        self.magic.store(0, Ordering::Relaxed);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue").field("id", &self.id).finish()
    }
}

/// A thread taken off a wait queue that has not been re-admitted yet
#[must_use = "a dequeued thread stays blocked until it is made ready or requeued"]
#[derive(Debug, PartialEq, Eq)]
pub struct Dequeued {
    thread: ThreadId,
}

impl Dequeued {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

// ============================================================================
// Queue table
// ============================================================================

/// Membership of every non-empty wait queue
#[derive(Debug, Default)]
pub(crate) struct QueueTable {
    queues: HashMap<WaitQueueId, VecDeque<ThreadId>>,
}

impl QueueTable {
    pub(crate) fn push_back(&mut self, queue: WaitQueueId, thread: ThreadId) {
        self.queues.entry(queue).or_default().push_back(thread);
    }

    pub(crate) fn pop_front(&mut self, queue: WaitQueueId) -> Option<ThreadId> {
        let members = self.queues.get_mut(&queue)?;
        let thread = members.pop_front();
        if members.is_empty() {
            self.queues.remove(&queue);
        }
        thread
    }

    pub(crate) fn drain(&mut self, queue: WaitQueueId) -> VecDeque<ThreadId> {
        self.queues.remove(&queue).unwrap_or_default()
    }

    /// Removes `thread` from `queue`; returns false if it was not there
    pub(crate) fn remove(&mut self, queue: WaitQueueId, thread: ThreadId) -> bool {
        let Some(members) = self.queues.get_mut(&queue) else {
            return false;
        };
        let Some(pos) = members.iter().position(|&t| t == thread) else {
            return false;
        };
        members.remove(pos);
        if members.is_empty() {
            self.queues.remove(&queue);
        }
        true
    }

    pub(crate) fn len(&self, queue: WaitQueueId) -> usize {
        self.queues.get(&queue).map_or(0, VecDeque::len)
    }

    pub(crate) fn contains(&self, queue: WaitQueueId, thread: ThreadId) -> bool {
        self.queues
            .get(&queue)
            .is_some_and(|members| members.contains(&thread))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (WaitQueueId, &VecDeque<ThreadId>)> {
        self.queues.iter().map(|(&id, members)| (id, members))
    }
}

// ============================================================================
// Guarded operations
// ============================================================================

impl KernelState {
    /// Stamps `status` on a blocked or sleeping thread and marks it `Ready`.
    /// The caller has already taken it off any queue.
    pub(crate) fn ready_with_status(&mut self, thread: ThreadId, status: Status) {
        let record = self.registry.record_mut(thread);
        record.wait.queue = None;
        record.wait.status = status;
        record.state = ThreadState::Ready;
    }

    /// Forces a parked thread out of its wait with `status`.
    ///
    /// Blocked threads are taken off their queue, sleeping threads are woken
    /// before their timer fires. Returns false if the thread was in neither
    /// wait (or sits dequeued, owned by whoever dequeued it).
    pub(crate) fn interrupt_wait(&mut self, thread: ThreadId, status: Status) -> bool {
        let record = self.registry.record_mut(thread);
        match record.state {
            ThreadState::Blocked => {
                let Some(queue) = record.wait.queue else {
                    return false;
                };
                if !self.queues.remove(queue, thread) {
                    panic!("{} blocked on {} but not enqueued there", thread, queue);
                }
            }
            ThreadState::Sleeping => {}
            _ => return false,
        }
        self.ready_with_status(thread, status);
        true
    }
}

impl ThreadGuard<'_> {
    pub(crate) fn block_on(&mut self, queue: WaitQueueId, deadline: Deadline, interruptable: bool) -> Status {
        let core = self.core();
        let current = core.require_current();
        let now = core.timer.now();

        let state = self.state_mut();
        let thread = state.registry.record_mut(current);
        if thread.state != ThreadState::Running {
            panic!("{} blocked on {} while {}", current, queue, thread.state);
        }
        if deadline.has_passed(now) {
            return Err(KernelError::TimedOut);
        }
        if interruptable {
            thread.signals.interrupt_status()?;
        }

        let generation = thread.wait.begin(Some(queue), interruptable);
        thread.leave_running(ThreadState::Blocked, now, core.config.time_slice_ns);
        state.queues.push_back(queue, current);
        if !deadline.is_infinite() {
            let timer = core.arm_timeout(current, generation, deadline, TimerSlack::NONE);
            state.registry.record_mut(current).wait.timer = Some(timer);
        }
        trace!("{} blocked on {} until {}", current, queue, deadline);

        self.park();
        core.finish_wait(self, current)
    }

    pub(crate) fn wake_one_on(&mut self, queue: WaitQueueId, reschedule: bool, status: Status) -> usize {
        let state = self.state_mut();
        let Some(thread) = state.queues.pop_front(queue) else {
            return 0;
        };
        state.ready_with_status(thread, status);
        trace!("{} woken from {} with {:?}", thread, queue, status);
        self.core().scheduler.make_ready(thread);
        if reschedule {
            self.core().relinquish(self, Relinquish::Reschedule);
        }
        1
    }

    pub(crate) fn wake_all_on(&mut self, queue: WaitQueueId, reschedule: bool, status: Status) -> usize {
        let state = self.state_mut();
        let woken: Vec<ThreadId> = state.queues.drain(queue).into_iter().collect();
        if woken.is_empty() {
            return 0;
        }
        for &thread in &woken {
            state.ready_with_status(thread, status);
        }
        trace!("{} woke {} threads with {:?}", queue, woken.len(), status);
        self.core().scheduler.make_ready_batch(&woken);
        if reschedule {
            self.core().relinquish(self, Relinquish::Reschedule);
        }
        woken.len()
    }

    /// Wakes a specific blocked thread out of whichever queue holds it.
    ///
    /// Fails with `BadState` unless the thread is `Blocked` on a queue.
    pub fn unblock_specific(&mut self, thread: ThreadId, status: Status) -> Status {
        let state = self.state_mut();
        let record = state.registry.lookup_mut(thread)?;
        if record.state != ThreadState::Blocked || record.wait.queue.is_none() {
            return Err(KernelError::BadState);
        }
        state.interrupt_wait(thread, status);
        self.core().scheduler.make_ready(thread);
        Ok(())
    }

    /// Hands a dequeued thread to the scheduler as runnable
    pub fn make_ready_dequeued(&mut self, dequeued: Dequeued) {
        let thread = dequeued.thread;
        self.state_mut().registry.record_mut(thread).state = ThreadState::Ready;
        self.core().scheduler.make_ready(thread);
    }

    /// Moves a dequeued thread onto the tail of `target` without waking it.
    ///
    /// The thread keeps the timeout of its original wait.
    pub fn requeue(&mut self, dequeued: Dequeued, target: &WaitQueue) {
        let queue = target.id();
        let state = self.state_mut();
        let record = state.registry.record_mut(dequeued.thread);
        record.wait.queue = Some(queue);
        record.wait.status = Ok(());
        state.queues.push_back(queue, dequeued.thread);
        trace!("{} requeued on {}", dequeued.thread, queue);
    }
}
