//! NOS Thread
//!
//! This crate provides the thread lifecycle and blocking-synchronization core
//! of the NOS microkernel: thread creation and teardown, the thread state
//! machine, signal delivery (kill, suspend, policy exception), sleeps with
//! timeouts and the wait queues every higher-level blocking primitive is
//! built on.
//!
//! # Architecture
//!
//! - **Lock** (`lock`): the single global thread lock and its guard
//! - **WaitQueue** (`wait_queue`): FIFO queues of blocked threads
//! - **Thread** (`thread`): the per-thread record and its attributes
//! - **Registry** (`registry`): every live thread, enumerable for debugging
//! - **Lifecycle** (`lifecycle`): create, resume, suspend, kill, exit, join
//! - **Signals** (`signal`): pending-signal processing at preemption points
//! - **Sleep** (`sleep`): timed sleeps and timeout expiry
//! - **Reclaim** (`reclaim`): deferred freeing of self-exiting threads
//!
//! The run-queue scheduler, the timer wheel and the exception channel are
//! collaborators described by traits in `nos-api`.
//!
//! # Lock discipline
//!
//! Every thread state, every signal mask and every wait-queue membership is
//! read and written with the global thread lock held, and only through a
//! [`ThreadGuard`]. The lock is released around scheduler parks and around
//! user callbacks; anything that may have changed meanwhile (a kill signal in
//! particular) is checked again after it is reacquired.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod thread_core;
pub mod lifecycle;
pub mod lock;
pub mod reclaim;
pub mod registry;
pub mod signal;
pub mod sleep;
pub mod stack;
pub mod thread;
pub mod wait_queue;

// Re-export commonly used items
pub use crate::config::{ThreadConfig, DEFAULT_PRIORITY, HIGHEST_PRIORITY, LOWEST_PRIORITY};
pub use crate::thread_core::{ResourceSnapshot, ThreadCore};
pub use crate::lifecycle::{ThreadBuilder, KILLED_RETCODE};
pub use crate::lock::ThreadGuard;
pub use crate::reclaim::ReclaimJob;
pub use crate::registry::ThreadInfo;
pub use crate::signal::{PendingSignal, Signals};
pub use crate::sleep::compute_slack;
pub use crate::stack::KernelStack;
pub use crate::thread::{SchedAttrs, ThreadEntry, ThreadFlags, ThreadName, UserStateCallback, UserStateChange};
pub use crate::wait_queue::{Dequeued, WaitQueue, WaitQueueId};

pub use nos_api::{Deadline, KernelError, Result, Status, ThreadId, ThreadState};
