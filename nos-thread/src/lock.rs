//! The global thread lock
//!
//! One spin lock guards every thread record and every wait-queue membership.
//! Taking it disables local interrupts through the scheduler bridge; the
//! guard releases the lock first and restores interrupts after, so a timer
//! interrupt never lands on a CPU that still holds the lock.

use nos_api::sync::MutexGuard;
use nos_api::IrqState;

use crate::registry::KernelState;
use crate::thread_core::ThreadCore;

/// Proof that the global thread lock is held.
///
/// Wait-queue operations hang off the guard, so they cannot be reached
/// without holding the lock. Blocking operations release the lock while the
/// caller is parked and hold it again when they return.
pub struct ThreadGuard<'a> {
    core: &'a ThreadCore,
    state: Option<MutexGuard<'a, KernelState>>,
    irq: Option<IrqState>,
}

impl ThreadCore {
    /// Acquires the global thread lock
    pub fn lock(&self) -> ThreadGuard<'_> {
        let irq = self.scheduler.disable_interrupts();
        let state = self.state.lock();
        ThreadGuard {
            core: self,
            state: Some(state),
            irq: Some(irq),
        }
    }

    /// Acquires the lock only if it is free right now
    pub(crate) fn try_lock(&self) -> Option<ThreadGuard<'_>> {
        let irq = self.scheduler.disable_interrupts();
        match self.state.try_lock() {
            Some(state) => Some(ThreadGuard {
                core: self,
                state: Some(state),
                irq: Some(irq),
            }),
            None => {
                self.scheduler.restore_interrupts(irq);
                None
            }
        }
    }
}

impl<'a> ThreadGuard<'a> {
    pub(crate) fn core(&self) -> &'a ThreadCore {
        self.core
    }

    pub(crate) fn state(&self) -> &KernelState {
        match self.state.as_deref() {
            Some(state) => state,
            None => panic!("thread lock accessed while released"),
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut KernelState {
        match self.state.as_deref_mut() {
            Some(state) => state,
            None => panic!("thread lock accessed while released"),
        }
    }

    /// Drops the lock, then restores interrupts
    pub(crate) fn release(&mut self) {
        drop(self.state.take());
        if let Some(irq) = self.irq.take() {
            self.core.scheduler.restore_interrupts(irq);
        }
    }

    /// Disables interrupts, then takes the lock again
    pub(crate) fn reacquire(&mut self) {
        debug_assert!(self.state.is_none());
        self.irq = Some(self.core.scheduler.disable_interrupts());
        self.state = Some(self.core.state.lock());
    }

    /// Parks the calling thread with the lock dropped.
    ///
    /// The caller has already moved the thread out of `Running`. The lock is
    /// held again on return.
    pub(crate) fn park(&mut self) {
        self.release();
        self.core.scheduler.block_current();
        self.reacquire();
    }

    /// Releases the lock explicitly
    pub fn unlock(self) {
        drop(self);
    }

    /// Gives up the guard but keeps the lock held, for a thread that holds
    /// it through its final switch. Returns the saved interrupt state.
    pub(crate) fn into_held(mut self) -> IrqState {
        match self.state.take() {
            Some(state) => core::mem::forget(state),
            None => panic!("thread lock handed off while released"),
        }
        self.irq.take().unwrap_or_default()
    }
}

impl ThreadCore {
    /// Releases a lock left held by [`ThreadGuard::into_held`]
    pub(crate) fn release_handed_off(&self, irq: IrqState) {
        // SAFETY: the guard that owned the lock was forgotten by the exiting
        // thread, which no longer runs
        unsafe { self.state.force_unlock() };
        self.scheduler.restore_interrupts(irq);
    }
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
