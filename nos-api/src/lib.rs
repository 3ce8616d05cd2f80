//! NOS API - Shared types and collaborator interfaces for the NOS thread core
//!
//! This crate provides the vocabulary shared between the thread lifecycle core
//! (`nos-thread`) and the pieces of the kernel it talks to but does not own:
//! the run-queue scheduler, the timer wheel and the user exception channel.
//!
//! # Architecture
//!
//! The API is organized into several key modules:
//!
//! - **Core**: identifiers, time values and the thread state enum
//! - **Error**: the kernel status taxonomy and `Result` alias
//! - **Process**: the scheduler bridge and exception port interfaces
//! - **Timer**: the one-shot timer interface used for sleeps and timeouts
//! - **Sync**: the lock primitives every NOS crate uses
//!
//! # Design Principles
//!
//! - **Dependency Inversion**: the thread core depends on these traits, never
//!   on a concrete scheduler or timer
//! - **Interface Segregation**: one small trait per collaborator
//!
//! # Usage
//!
//! ```rust
//! use nos_api::{Deadline, KernelError, Status};
//!
//! fn expired(now: u64, deadline: Deadline) -> Status {
//!     if deadline.has_passed(now) {
//!         Err(KernelError::TimedOut)
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! assert_eq!(expired(10, Deadline::at(5)), Err(KernelError::TimedOut));
//! assert_eq!(expired(10, Deadline::INFINITE), Ok(()));
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "alloc")]
extern crate alloc;

// Core modules
pub mod core;
pub mod error;
#[cfg(feature = "alloc")]
pub mod process;
#[cfg(feature = "alloc")]
pub mod timer;
pub mod sync;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{KernelError, Result, Status};
#[cfg(feature = "alloc")]
pub use crate::process::interface::{ExceptionPort, ExitHandoff, SchedulerBridge, ThreadStart};
#[cfg(feature = "alloc")]
pub use crate::process::types::{IrqState, PolicyException, PolicyExceptionReport};
#[cfg(feature = "alloc")]
pub use crate::timer::interface::{TimerCallback, TimerEvent, TimerHandle, TimerQueue, TimerSlack};
