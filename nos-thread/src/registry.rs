//! Thread registry
//!
//! Every live thread record, keyed by id, together with the wait-queue
//! membership table. Both live behind the global thread lock as one
//! [`KernelState`].

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::info;
use nos_api::{CpuId, KernelError, Nanoseconds, Pid, Result, ThreadId, ThreadState};

use crate::signal::Signals;
use crate::thread::{Thread, ThreadFlags, ThreadName, THREAD_MAGIC};
use crate::thread_core::ThreadCore;
use crate::wait_queue::{QueueTable, WaitQueueId};

/// Everything the global thread lock protects
#[derive(Default)]
pub(crate) struct KernelState {
    pub(crate) registry: ThreadRegistry,
    pub(crate) queues: QueueTable,
}

/// Thread table
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    /// Live records in creation order
    threads: BTreeMap<ThreadId, Box<Thread>>,
    /// Next thread ID to allocate
    next_id: u64,
}

impl ThreadRegistry {
    pub(crate) fn allocate_id(&mut self) -> ThreadId {
        self.next_id += 1;
        ThreadId::new(self.next_id)
    }

    pub(crate) fn insert(&mut self, thread: Box<Thread>) {
        self.threads.insert(thread.id, thread);
    }

    /// Unknown ids: never allocated is `InvalidArgs`, already freed is `BadState`
    fn missing(&self, id: ThreadId) -> KernelError {
        if id.as_u64() != 0 && id.as_u64() <= self.next_id {
            KernelError::BadState
        } else {
            KernelError::InvalidArgs
        }
    }

    pub(crate) fn lookup(&self, id: ThreadId) -> Result<&Thread> {
        let thread = self.threads.get(&id).ok_or_else(|| self.missing(id))?;
        thread.check_magic();
        Ok(thread)
    }

    pub(crate) fn lookup_mut(&mut self, id: ThreadId) -> Result<&mut Thread> {
        let err = self.missing(id);
        let thread = self.threads.get_mut(&id).ok_or(err)?;
        thread.check_magic();
        Ok(thread)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let thread = self.threads.get_mut(&id)?;
        thread.check_magic();
        Some(thread)
    }

    /// Record of a thread the caller knows is registered
    pub(crate) fn record_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.get_mut(id) {
            Some(thread) => thread,
            None => panic!("{} is not registered", id),
        }
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Box<Thread>> {
        self.threads.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values().map(|thread| &**thread)
    }
}

impl KernelState {
    /// Takes a thread out of the registry for freeing.
    ///
    /// # Panics
    ///
    /// Panics if threads are still waiting on its join queue.
    pub(crate) fn unlink(&mut self, id: ThreadId) -> Option<Box<Thread>> {
        let thread = self.registry.remove(id)?;
        let joiners = thread.joiners.id();
        let waiting = self.queues.len(joiners);
        if waiting != 0 {
            panic!("{} retired with {} threads on its join queue", id, waiting);
        }
        Some(thread)
    }

    /// Checks the queue/thread back-reference invariant in both directions
    pub(crate) fn audit(&self) -> core::result::Result<(), String> {
        let mut enqueued = 0usize;
        for (queue, members) in self.queues.iter() {
            for &id in members {
                enqueued += 1;
                let thread = self
                    .registry
                    .threads
                    .get(&id)
                    .ok_or_else(|| format!("{} on {} is not registered", id, queue))?;
                if thread.state != ThreadState::Blocked {
                    return Err(format!("{} on {} is {}", id, queue, thread.state));
                }
                if thread.wait.queue != Some(queue) {
                    return Err(format!(
                        "{} on {} points at {:?}",
                        id, queue, thread.wait.queue
                    ));
                }
            }
        }

        let mut linked = 0usize;
        for thread in self.registry.threads.values() {
            if thread.magic != THREAD_MAGIC {
                return Err(format!("{} has magic {:#x}", thread.id, thread.magic));
            }
            if !Signals::all().contains(thread.signals) {
                return Err(format!("{} has signal bits {:#x}", thread.id, thread.signals.bits()));
            }
            match (thread.state, thread.wait.queue) {
                (ThreadState::Blocked, Some(queue)) => {
                    if !self.queues.contains(queue, thread.id) {
                        return Err(format!("{} claims {} but is not on it", thread.id, queue));
                    }
                    linked += 1;
                }
                // Dequeued and awaiting re-admission
                (ThreadState::Blocked, None) => {}
                (state, Some(queue)) => {
                    return Err(format!("{} is {} but linked to {}", thread.id, state, queue));
                }
                (_, None) => {}
            }
        }

        if linked != enqueued {
            return Err(format!("{} queue entries but {} linked threads", enqueued, linked));
        }
        Ok(())
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Read-only view of one thread, taken under the lock
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: ThreadName,
    pub process: Option<Pid>,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub signals: Signals,
    pub priority: u8,
    pub last_cpu: Option<CpuId>,
    pub runtime: Nanoseconds,
    /// Monotonic time the record was created
    pub created_at: Nanoseconds,
    pub waiting_on: Option<WaitQueueId>,
    /// Set once the thread is dead
    pub retcode: Option<i32>,
}

impl ThreadInfo {
    fn from_thread(thread: &Thread) -> Self {
        Self {
            id: thread.id,
            name: thread.name.clone(),
            process: thread.process,
            state: thread.state,
            flags: thread.flags,
            signals: thread.signals,
            priority: thread.sched.effective_priority(),
            last_cpu: thread.sched.last_cpu,
            runtime: thread.sched.runtime,
            created_at: thread.created_at,
            waiting_on: thread.wait.queue,
            retcode: (thread.state == ThreadState::Death).then_some(thread.retcode),
        }
    }
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<32} {:<5} pri {:>2} sig {:#05b}",
            self.id,
            self.name.as_str(),
            self.state.label(),
            self.priority,
            self.signals.bits()
        )?;
        if let Some(pid) = self.process {
            write!(f, " pid {}", pid)?;
        }
        if let Some(cpu) = self.last_cpu {
            write!(f, " cpu {}", cpu)?;
        }
        if let Some(queue) = self.waiting_on {
            write!(f, " on {}", queue)?;
        }
        if let Some(retcode) = self.retcode {
            write!(f, " ret {}", retcode)?;
        }
        write!(f, " runtime {}ns", self.runtime)
    }
}

impl ThreadCore {
    /// Snapshot of every live thread in creation order
    pub fn snapshot(&self) -> Vec<ThreadInfo> {
        let guard = self.lock();
        guard
            .state()
            .registry
            .iter()
            .map(ThreadInfo::from_thread)
            .collect()
    }

    /// Logs every live thread
    pub fn dump(&self) {
        let threads = self.snapshot();
        info!("{} threads", threads.len());
        for thread in &threads {
            info!("  {}", thread);
        }
    }

    /// Verifies registry and wait-queue consistency under the lock
    pub fn audit(&self) -> core::result::Result<(), String> {
        self.lock().state().audit()
    }

    pub fn thread_state(&self, thread: ThreadId) -> Result<ThreadState> {
        let guard = self.lock();
        Ok(guard.state().registry.lookup(thread)?.state)
    }

    pub fn thread_signals(&self, thread: ThreadId) -> Result<Signals> {
        let guard = self.lock();
        Ok(guard.state().registry.lookup(thread)?.signals)
    }

    pub fn thread_info(&self, thread: ThreadId) -> Result<ThreadInfo> {
        let guard = self.lock();
        Ok(ThreadInfo::from_thread(guard.state().registry.lookup(thread)?))
    }

    /// Returns true while `thread` has a registry entry
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.lock().state().registry.lookup(thread).is_ok()
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.lock().state().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
