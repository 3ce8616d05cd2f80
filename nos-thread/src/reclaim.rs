//! Deferred reclamation of self-exiting threads
//!
//! A detached thread that owns its stack cannot free that stack while it is
//! still running on it. Its exit path hands the unregistered record to the
//! reclaimer as a [`ReclaimJob`], asks the scheduler bridge to wake the
//! reclaim worker, and that worker frees it through
//! [`ThreadCore::run_deferred_reclaim`]. The worker takes the global thread
//! lock before each job, so it cannot run before the dead thread has
//! switched away.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use log::debug;
use nos_api::sync::{Mutex, Ordering};
use nos_api::ThreadId;

use crate::thread::Thread;
use crate::thread_core::ThreadCore;

/// Ownership of a dead thread's record and stack, in transit to the reclaimer
pub struct ReclaimJob {
    thread: Box<Thread>,
}

impl ReclaimJob {
    pub(crate) fn new(thread: Box<Thread>) -> Self {
        Self { thread }
    }

    /// Thread whose resources this job frees
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id
    }
}

impl fmt::Debug for ReclaimJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimJob").field("thread", &self.thread.id).finish()
    }
}

/// FIFO of pending reclaim jobs
pub(crate) struct DeferredReclaimer {
    jobs: Mutex<VecDeque<ReclaimJob>>,
}

impl DeferredReclaimer {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn schedule(&self, job: ReclaimJob) {
        self.jobs.lock().push_back(job);
    }

    fn next(&self) -> Option<ReclaimJob> {
        self.jobs.lock().pop_front()
    }

    pub(crate) fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl ThreadCore {
    /// Queues the record of a thread that just exited on its own stack
    pub(crate) fn defer_reclaim(&self, thread: Box<Thread>) {
        debug!("deferring reclaim of {}", thread.id);
        self.stats.deferred_reclaims.fetch_add(1, Ordering::Relaxed);
        self.reclaimer.schedule(ReclaimJob::new(thread));
        self.scheduler.schedule_reclaim();
    }

    /// Worker-context entry point: frees every queued record.
    ///
    /// Returns the number of jobs run.
    pub fn run_deferred_reclaim(&self) -> usize {
        let mut ran = 0;
        // The lock is held by a dying thread until it is off its stack
        while let Some(job) = self.lock_and_next() {
            debug!("reclaiming {}", job.thread_id());
            self.free_thread_resources(job.thread);
            ran += 1;
        }
        ran
    }

    fn lock_and_next(&self) -> Option<ReclaimJob> {
        let _guard = self.lock();
        self.reclaimer.next()
    }

    /// Jobs waiting for the reclaim worker
    pub fn pending_reclaims(&self) -> usize {
        self.reclaimer.pending()
    }
}
