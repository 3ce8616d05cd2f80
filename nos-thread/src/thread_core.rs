//! The thread core
//!
//! [`ThreadCore`] owns the global thread lock, the stack pool and the
//! deferred reclaimer, and holds the collaborators it drives: the scheduler
//! bridge, the timer queue and the exception port. The lifecycle, wait,
//! sleep and signal operations are implemented on it in their own modules.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

use nos_api::sync::{AtomicU64, Mutex, Ordering};
use nos_api::{
    Deadline, ExceptionPort, Result, SchedulerBridge, ThreadId, TimerHandle, TimerQueue,
    TimerSlack,
};

use crate::config::ThreadConfig;
use crate::lock::ThreadGuard;
use crate::reclaim::DeferredReclaimer;
use crate::registry::KernelState;
use crate::stack::StackPool;
use crate::thread::Thread;

/// Thread lifecycle and blocking-synchronization core
pub struct ThreadCore {
    /// Handle to ourselves for timer callbacks and thread trampolines
    pub(crate) this: Weak<ThreadCore>,
    pub(crate) config: ThreadConfig,
    /// The global thread lock
    pub(crate) state: Mutex<KernelState>,
    pub(crate) scheduler: Arc<dyn SchedulerBridge>,
    pub(crate) timer: Arc<dyn TimerQueue>,
    pub(crate) exceptions: Mutex<Option<Arc<dyn ExceptionPort>>>,
    pub(crate) stacks: StackPool,
    pub(crate) reclaimer: DeferredReclaimer,
    pub(crate) stats: ResourceStats,
}

static_assertions::assert_impl_all!(ThreadCore: Send, Sync);

impl ThreadCore {
    pub fn new(
        config: ThreadConfig,
        scheduler: Arc<dyn SchedulerBridge>,
        timer: Arc<dyn TimerQueue>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            stacks: StackPool::new(config.default_stack_size, config.stack_pool_limit),
            config,
            state: Mutex::new(KernelState::default()),
            scheduler,
            timer,
            exceptions: Mutex::new(None),
            reclaimer: DeferredReclaimer::new(),
            stats: ResourceStats::default(),
        }))
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// Installs the channel policy exceptions are reported through
    pub fn set_exception_port(&self, port: Arc<dyn ExceptionPort>) {
        *self.exceptions.lock() = Some(port);
    }

    /// Thread the scheduler says is running on this CPU
    pub fn current(&self) -> Option<ThreadId> {
        self.scheduler.current_thread()
    }

    pub(crate) fn require_current(&self) -> ThreadId {
        match self.scheduler.current_thread() {
            Some(thread) => thread,
            None => panic!("blocking thread operation with no current thread"),
        }
    }

    /// Puts the calling thread back into `Running` after it was scheduled
    pub(crate) fn mark_running(&self, guard: &mut ThreadGuard<'_>, current: ThreadId) {
        let cpu = self.scheduler.current_cpu();
        let now = self.timer.now();
        guard.state_mut().registry.record_mut(current).set_running(cpu, now);
    }

    /// Arms the timeout of wait number `generation` of `thread`
    pub(crate) fn arm_timeout(
        &self,
        thread: ThreadId,
        generation: u64,
        deadline: Deadline,
        slack: TimerSlack,
    ) -> TimerHandle {
        let core = self.this.clone();
        self.timer.arm(
            deadline,
            slack,
            Box::new(move |event| {
                if let Some(core) = core.upgrade() {
                    core.handle_timeout(thread, generation, event);
                }
            }),
        )
    }

    /// Frees a record that is no longer registered
    pub(crate) fn free_thread_resources(&self, mut thread: Box<Thread>) {
        if let Some(stack) = thread.stack.take() {
            self.stacks.release(stack);
        }
        self.stats.records_freed.fetch_add(1, Ordering::Relaxed);
        drop(thread);
    }

    /// Current resource counters
    pub fn stats(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            threads_created: self.stats.threads_created.load(Ordering::Relaxed),
            records_freed: self.stats.records_freed.load(Ordering::Relaxed),
            deferred_reclaims: self.stats.deferred_reclaims.load(Ordering::Relaxed),
            stacks_allocated: self.stacks.counters.allocated.load(Ordering::Relaxed),
            stacks_reused: self.stacks.counters.reused.load(Ordering::Relaxed),
            stacks_released: self.stacks.counters.released.load(Ordering::Relaxed),
            stacks_pooled: self.stacks.pooled(),
        }
    }
}

// ============================================================================
// Resource accounting
// ============================================================================

/// Allocation counters
#[derive(Debug, Default)]
pub(crate) struct ResourceStats {
    pub(crate) threads_created: AtomicU64,
    pub(crate) records_freed: AtomicU64,
    pub(crate) deferred_reclaims: AtomicU64,
}

/// Point-in-time copy of the resource counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    /// Thread records created, boot and idle threads included
    pub threads_created: u64,
    /// Thread records freed by join, detach, forget or the reclaimer
    pub records_freed: u64,
    /// Frees handed to the deferred reclaimer
    pub deferred_reclaims: u64,
    /// Stacks freshly allocated
    pub stacks_allocated: u64,
    /// Stacks taken from the reuse pool
    pub stacks_reused: u64,
    /// Owned stacks given back
    pub stacks_released: u64,
    /// Stacks currently sitting in the pool
    pub stacks_pooled: usize,
}

impl ResourceSnapshot {
    /// Records created but not yet freed
    pub fn live_records(&self) -> u64 {
        self.threads_created.saturating_sub(self.records_freed)
    }
}
