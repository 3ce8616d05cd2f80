//! Thread lifecycle
//!
//! Creation, resume, suspend, kill, exit, join, detach and forget, plus the
//! boot and idle threads and voluntary rescheduling.
//!
//! Lifecycle:
//! Initial -> Ready <-> Running -> Blocked/Sleeping/Suspended -> Ready -> ...
//!                         \-> Death -> (join/detach/forget/reclaim) freed

use alloc::boxed::Box;
use core::fmt::Write;

use log::{debug, trace, warn};
use nos_api::{
    CpuId, Deadline, ExitHandoff, KernelError, Pid, Result, Status, ThreadId, ThreadStart,
    ThreadState,
};

use crate::config::{HIGHEST_PRIORITY, LOWEST_PRIORITY};
use crate::lock::ThreadGuard;
use crate::signal::Signals;
use crate::stack::KernelStack;
use crate::thread::{
    anonymous_name, make_name, SchedAttrs, Thread, ThreadEntry, ThreadFlags, ThreadName,
    UserStateCallback, UserStateChange,
};
use crate::thread_core::ThreadCore;

/// Retcode of a thread that exited because it was killed
pub const KILLED_RETCODE: i32 = KernelError::InterruptedKilled.as_errno();

/// How the current thread gives up its CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relinquish {
    Yield,
    Preempt,
    Reschedule,
}

// ============================================================================
// Thread builder
// ============================================================================

/// Thread creation parameters
#[derive(Default)]
pub struct ThreadBuilder {
    name: Option<ThreadName>,
    priority: Option<u8>,
    pinned_cpu: Option<CpuId>,
    process: Option<Pid>,
    detached: bool,
    idle: bool,
    stack: Option<KernelStack>,
    stack_size: Option<usize>,
    callback: Option<UserStateCallback>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread name; truncated to 32 bytes
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(make_name(name));
        self
    }

    /// Base priority, `0..=31`
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn pinned_cpu(mut self, cpu: CpuId) -> Self {
        self.pinned_cpu = Some(cpu);
        self
    }

    /// Owning process, recorded for diagnostics only
    pub fn process(mut self, pid: Pid) -> Self {
        self.process = Some(pid);
        self
    }

    /// Create the thread detached: it frees itself when it exits
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Run on a stack the caller allocated and keeps ownership of
    pub fn stack(mut self, stack: KernelStack) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Size of the stack the core allocates for the thread
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Callback told when the thread suspends, resumes and exits
    pub fn user_state_callback(mut self, callback: UserStateCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    /// Creates the thread in `Initial`; it runs `entry` once resumed and
    /// exits with its return value
    pub fn spawn<F>(self, core: &ThreadCore, entry: F) -> Result<ThreadId>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let priority = self.priority.unwrap_or(core.config.default_priority);
        if priority > HIGHEST_PRIORITY {
            return Err(KernelError::InvalidArgs);
        }

        let stack = match self.stack {
            Some(stack) if stack.size() == 0 => return Err(KernelError::InvalidArgs),
            Some(stack) => stack,
            None => {
                let size = self.stack_size.unwrap_or(core.config.default_stack_size);
                if size == 0 || size > core.config.max_stack_size {
                    return Err(KernelError::InvalidArgs);
                }
                core.stacks.allocate(size)?
            }
        };

        let mut flags = ThreadFlags::empty();
        flags.set(ThreadFlags::STACK_OWNED, stack.is_owned());
        flags.set(ThreadFlags::DETACHED, self.detached);
        flags.set(ThreadFlags::IDLE, self.idle);

        let mut sched = SchedAttrs::new(priority, core.config.time_slice_ns);
        sched.pinned_cpu = self.pinned_cpu;

        let entry: ThreadEntry = Box::new(entry);
        core.register(self.name, flags, sched, self.process, Some(stack), Some(entry), self.callback)
    }
}

// ============================================================================
// Lifecycle operations
// ============================================================================

impl ThreadCore {
    /// Creates a thread with default attributes
    pub fn create<F>(&self, name: &str, priority: u8, entry: F) -> Result<ThreadId>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        ThreadBuilder::new().name(name).priority(priority).spawn(self, entry)
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        name: Option<ThreadName>,
        flags: ThreadFlags,
        sched: SchedAttrs,
        process: Option<Pid>,
        stack: Option<KernelStack>,
        entry: Option<ThreadEntry>,
        callback: Option<UserStateCallback>,
    ) -> Result<ThreadId> {
        let now = self.timer.now();
        let mut guard = self.lock();
        let state = guard.state_mut();

        // Records waiting for the reclaimer still hold their memory
        if state.registry.len() + self.reclaimer.pending() >= self.config.max_threads {
            if let Some(stack) = stack {
                self.stacks.release(stack);
            }
            warn!("thread table full ({} threads)", self.config.max_threads);
            return Err(KernelError::NoResources);
        }

        let id = state.registry.allocate_id();
        let name = name.unwrap_or_else(|| anonymous_name(id));
        let mut thread = Box::new(Thread::new(id, name, sched, now));
        thread.flags = flags;
        thread.process = process;
        thread.stack = stack;
        thread.entry = entry;
        thread.callback = callback;

        debug!(
            "created {} '{}' pri {} flags {:?}",
            id,
            thread.name.as_str(),
            thread.sched.base_priority,
            thread.flags
        );
        state.registry.insert(thread);
        self.stats
            .threads_created
            .fetch_add(1, nos_api::sync::Ordering::Relaxed);
        Ok(id)
    }

    /// Adopts the calling boot context as an already running thread.
    ///
    /// The thread has no entry and no stack owned by the core.
    pub fn construct_first(&self, name: &str) -> Result<ThreadId> {
        let id = self.register(
            Some(make_name(name)),
            ThreadFlags::BOOT,
            SchedAttrs::new(self.config.default_priority, self.config.time_slice_ns),
            None,
            None,
            None,
            None,
        )?;

        let cpu = self.scheduler.current_cpu();
        let now = self.timer.now();
        let mut guard = self.lock();
        guard.state_mut().registry.record_mut(id).set_running(cpu, now);
        self.scheduler.adopt_current(id);
        Ok(id)
    }

    /// Creates and starts the idle thread of `cpu`.
    ///
    /// Idle threads cannot be suspended or killed and must never exit.
    pub fn create_idle<F>(&self, cpu: CpuId, entry: F) -> Result<ThreadId>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let mut name = ThreadName::new();
        let _ = write!(name, "idle-{}", cpu);
        let id = ThreadBuilder {
            name: Some(name),
            ..ThreadBuilder::new()
        }
        .priority(LOWEST_PRIORITY)
        .pinned_cpu(cpu)
        .idle()
        .spawn(self, entry)?;
        self.resume(id)?;
        Ok(id)
    }

    /// Makes a thread runnable.
    ///
    /// Starts an `Initial` thread, releases a `Suspended` one and cancels a
    /// suspend still pending on any other live thread. Resuming a dead
    /// thread succeeds and does nothing.
    pub fn resume(&self, thread: ThreadId) -> Status {
        let mut guard = self.lock();
        let record = guard.state_mut().registry.lookup_mut(thread)?;
        match record.state {
            ThreadState::Initial => {
                record.state = ThreadState::Ready;
                debug!("starting {}", thread);
                self.scheduler.start(thread, self.trampoline(thread));
            }
            ThreadState::Suspended => {
                record.signals.remove(Signals::SUSPEND);
                record.state = ThreadState::Ready;
                debug!("resuming {}", thread);
                self.scheduler.make_ready(thread);
            }
            ThreadState::Death => warn!("resume of dead thread {}", thread),
            _ => record.signals.remove(Signals::SUSPEND),
        }
        Ok(())
    }

    fn trampoline(&self, thread: ThreadId) -> ThreadStart {
        let core = self.this.clone();
        Box::new(move || {
            if let Some(core) = core.upgrade() {
                core.run_thread(thread);
            }
        })
    }

    /// First code a new thread runs on its own context
    fn run_thread(&self, thread: ThreadId) -> ! {
        let entry = {
            let mut guard = self.lock();
            self.mark_running(&mut guard, thread);
            // Killed or suspended before it first ran
            self.process_signals(&mut guard);
            guard.state_mut().registry.record_mut(thread).entry.take()
        };

        let retcode = match entry {
            Some(entry) => entry(),
            None => 0,
        };
        self.exit(retcode)
    }

    /// Requests that `thread` stop at its next preemption point.
    ///
    /// An interruptable wait is cut short with `InterruptedRetry`.
    pub fn suspend(&self, thread: ThreadId) -> Status {
        let current = self.scheduler.current_thread();
        let cpu = self.scheduler.current_cpu();
        let mut guard = self.lock();
        let state = guard.state_mut();

        let record = state.registry.lookup_mut(thread)?;
        if record.is_idle() {
            return Err(KernelError::BadState);
        }
        if matches!(record.state, ThreadState::Initial | ThreadState::Death) {
            return Err(KernelError::BadState);
        }
        record.signals.insert(Signals::SUSPEND);
        debug!("suspend requested for {} ({})", thread, record.state);

        let run_state = record.state;
        let interruptable = record.wait.interruptable;
        let last_cpu = record.sched.last_cpu;
        match run_state {
            ThreadState::Running if current != Some(thread) => self.nudge(last_cpu, cpu),
            ThreadState::Blocked | ThreadState::Sleeping if interruptable => {
                if state.interrupt_wait(thread, Err(KernelError::InterruptedRetry)) {
                    self.scheduler.make_ready(thread);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Kills `thread`.
    ///
    /// The thread exits at its next preemption point; interruptable waits
    /// are cut short with `InterruptedKilled` and a suspended thread is
    /// released so it can die. With `block` set the caller waits until the
    /// thread is dead, unless it is detached.
    pub fn kill(&self, thread: ThreadId, block: bool) -> Status {
        let current = self.scheduler.current_thread();
        let cpu = self.scheduler.current_cpu();
        let mut guard = self.lock();
        let state = guard.state_mut();

        let record = state.registry.lookup_mut(thread)?;
        if record.is_idle() {
            return Err(KernelError::BadState);
        }
        match record.state {
            ThreadState::Initial => return Err(KernelError::BadState),
            ThreadState::Death => return Ok(()),
            _ => {}
        }
        record.signals.insert(Signals::KILL);
        debug!("kill requested for {} ({})", thread, record.state);

        // Self-kill is processed by the next signal check
        if current == Some(thread) {
            return Ok(());
        }

        let run_state = record.state;
        let interruptable = record.wait.interruptable;
        let last_cpu = record.sched.last_cpu;
        let detached = record.is_detached();
        match run_state {
            ThreadState::Running => self.nudge(last_cpu, cpu),
            ThreadState::Suspended => {
                record.state = ThreadState::Ready;
                self.scheduler.make_ready(thread);
            }
            ThreadState::Blocked | ThreadState::Sleeping if interruptable => {
                if state.interrupt_wait(thread, Err(KernelError::InterruptedKilled)) {
                    self.scheduler.make_ready(thread);
                }
            }
            _ => {}
        }

        if block && !detached {
            self.wait_for_death(&mut guard, thread);
        }
        Ok(())
    }

    /// Sends a reschedule IPI if the thread last ran on another CPU
    fn nudge(&self, last_cpu: Option<CpuId>, this_cpu: CpuId) {
        if let Some(remote) = last_cpu.filter(|&remote| remote != this_cpu) {
            trace!("reschedule ipi to cpu {}", remote);
            self.scheduler.send_reschedule_ipi(remote);
        }
    }

    fn wait_for_death(&self, guard: &mut ThreadGuard<'_>, thread: ThreadId) {
        loop {
            // Gone means someone already joined it
            let Ok(record) = guard.state_mut().registry.lookup_mut(thread) else {
                return;
            };
            if record.state == ThreadState::Death || record.is_detached() {
                return;
            }
            let joiners = record.joiners.id();
            if guard.block_on(joiners, Deadline::INFINITE, false) == Err(KernelError::BadState) {
                return;
            }
        }
    }

    /// Terminates the calling thread with `retcode`. Never returns.
    ///
    /// # Panics
    ///
    /// Panics when called from the idle thread, from a thread that is
    /// already exiting or from a thread that is not `Running`.
    pub fn exit(&self, retcode: i32) -> ! {
        let current = self.require_current();
        let callback = {
            let mut guard = self.lock();
            let thread = guard.state_mut().registry.record_mut(current);
            if thread.is_idle() {
                panic!("idle thread {} tried to exit", current);
            }
            if thread.exiting {
                panic!("recursive exit of {}", current);
            }
            if thread.state != ThreadState::Running {
                panic!("{} exited while {}", current, thread.state);
            }
            thread.exiting = true;
            thread.callback.clone()
        };

        if let Some(callback) = callback {
            callback(current, UserStateChange::Exit);
        }

        let mut guard = self.lock();
        self.exit_locked(&mut guard, current, retcode);

        // Joiners and the reclaimer stay off this stack until the switch
        let irq = guard.into_held();
        let core = self.this.clone();
        self.scheduler.exit_current(ExitHandoff::new(move || {
            if let Some(core) = core.upgrade() {
                core.release_handed_off(irq);
            }
        }));
        panic!("{} ran again after exit", current);
    }

    fn exit_locked(&self, guard: &mut ThreadGuard<'_>, current: ThreadId, retcode: i32) {
        let now = self.timer.now();
        let state = guard.state_mut();
        let thread = state.registry.record_mut(current);
        thread.leave_running(ThreadState::Death, now, self.config.time_slice_ns);
        thread.retcode = retcode;
        debug!("{} exited with {}", current, retcode);

        if thread.is_detached() {
            let owns_stack = thread.flags.contains(ThreadFlags::STACK_OWNED);
            if let Some(record) = state.unlink(current) {
                // Still running on that stack; free it from another context
                if owns_stack {
                    self.defer_reclaim(record);
                } else {
                    self.free_thread_resources(record);
                }
            }
        } else {
            let joiners = thread.joiners.id();
            guard.wake_all_on(joiners, false, Ok(()));
        }
    }

    /// Waits for `thread` to die, frees it and returns its retcode
    pub fn join(&self, thread: ThreadId, deadline: Deadline) -> Result<i32> {
        let current = self.scheduler.current_thread();
        let mut guard = self.lock();
        loop {
            let record = guard.state_mut().registry.lookup_mut(thread)?;
            if record.is_detached() || current == Some(thread) {
                return Err(KernelError::BadState);
            }
            if record.state == ThreadState::Death {
                break;
            }
            let joiners = record.joiners.id();
            guard.block_on(joiners, deadline, false)?;
        }

        let Some(record) = guard.state_mut().unlink(thread) else {
            return Err(KernelError::BadState);
        };
        let retcode = record.retcode;
        self.free_thread_resources(record);
        debug!("joined {} with {}", thread, retcode);
        Ok(retcode)
    }

    /// Lets `thread` free itself at exit.
    ///
    /// Current joiners are woken with `BadState`. A thread that is already
    /// dead is freed immediately.
    pub fn detach(&self, thread: ThreadId) -> Status {
        let mut guard = self.lock();
        let record = guard.state_mut().registry.lookup_mut(thread)?;
        let joiners = record.joiners.id();
        let dead = record.state == ThreadState::Death;
        guard.wake_all_on(joiners, false, Err(KernelError::BadState));

        if dead {
            if let Some(record) = guard.state_mut().unlink(thread) {
                self.free_thread_resources(record);
            }
            debug!("detached dead thread {}, freed", thread);
        } else {
            guard
                .state_mut()
                .registry
                .record_mut(thread)
                .flags
                .insert(ThreadFlags::DETACHED);
            debug!("detached {}", thread);
        }
        Ok(())
    }

    /// Unregisters and frees `thread` at once, whatever its state.
    ///
    /// # Safety
    ///
    /// The caller guarantees the thread is not executing and that nothing
    /// else refers to it; its context is simply dropped.
    ///
    /// # Panics
    ///
    /// Panics when a thread tries to forget itself.
    pub unsafe fn forget(&self, thread: ThreadId) -> Status {
        if self.scheduler.current_thread() == Some(thread) {
            panic!("{} tried to forget itself", thread);
        }

        let mut guard = self.lock();
        let state = guard.state_mut();
        let record = state.registry.lookup_mut(thread)?;
        let joiners = record.joiners.id();
        let queue = record.wait.queue.take();
        let timer = record.wait.timer.take();
        if let Some(queue) = queue {
            state.queues.remove(queue, thread);
        }
        guard.wake_all_on(joiners, false, Err(KernelError::BadState));
        if let Some(timer) = timer {
            self.timer.cancel(timer);
        }

        if let Some(record) = guard.state_mut().unlink(thread) {
            self.free_thread_resources(record);
        }
        debug!("forgot {}", thread);
        Ok(())
    }

    // ========================================================================
    // Voluntary rescheduling
    // ========================================================================

    /// Gives the rest of the quantum to other ready threads
    pub fn yield_current(&self) {
        let mut guard = self.lock();
        self.relinquish(&mut guard, Relinquish::Yield);
    }

    /// Gives up the CPU because the quantum was forcibly ended
    pub fn preempt(&self) {
        let mut guard = self.lock();
        self.relinquish(&mut guard, Relinquish::Preempt);
    }

    /// Lets the scheduler pick the next thread to run
    pub fn reschedule(&self) {
        let mut guard = self.lock();
        self.relinquish(&mut guard, Relinquish::Reschedule);
    }

    pub(crate) fn relinquish(&self, guard: &mut ThreadGuard<'_>, how: Relinquish) {
        let Some(current) = self.scheduler.current_thread() else {
            return;
        };
        let now = self.timer.now();
        let Some(thread) = guard.state_mut().registry.get_mut(current) else {
            return;
        };
        if thread.state != ThreadState::Running {
            return;
        }
        thread.leave_running(ThreadState::Ready, now, self.config.time_slice_ns);

        guard.release();
        match how {
            Relinquish::Yield => self.scheduler.yield_current(),
            Relinquish::Preempt => self.scheduler.preempt_current(),
            Relinquish::Reschedule => self.scheduler.reschedule(),
        }
        guard.reacquire();
        self.mark_running(guard, current);
    }

    // ========================================================================
    // Scheduling attributes
    // ========================================================================

    pub fn sched_attrs(&self, thread: ThreadId) -> Result<SchedAttrs> {
        let guard = self.lock();
        Ok(guard.state().registry.lookup(thread)?.sched)
    }

    pub fn set_priority(&self, thread: ThreadId, priority: u8) -> Status {
        if priority > HIGHEST_PRIORITY {
            return Err(KernelError::InvalidArgs);
        }
        let mut guard = self.lock();
        guard.state_mut().registry.lookup_mut(thread)?.sched.base_priority = priority;
        Ok(())
    }

    /// Sets the transient boost; clamped so it never exceeds the priority range
    pub fn set_priority_boost(&self, thread: ThreadId, boost: i8) -> Status {
        let limit = HIGHEST_PRIORITY as i8;
        let mut guard = self.lock();
        guard.state_mut().registry.lookup_mut(thread)?.sched.priority_boost = boost.clamp(-limit, limit);
        Ok(())
    }

    pub fn set_pinned_cpu(&self, thread: ThreadId, cpu: Option<CpuId>) -> Status {
        let mut guard = self.lock();
        guard.state_mut().registry.lookup_mut(thread)?.sched.pinned_cpu = cpu;
        Ok(())
    }
}
