//! Scheduler bridge contract tests
//!
//! These drive the core against mocked collaborators and check which bridge
//! calls each operation makes. Nothing here parks a thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mockall::predicate::{always, eq};
use mockall::{mock, Sequence};
use nos_api::{
    CpuId, Deadline, ExitHandoff, IrqState, Nanoseconds, SchedulerBridge, ThreadId, ThreadStart,
    TimerCallback, TimerHandle, TimerQueue, TimerSlack,
};
use nos_thread::{
    KernelError, ThreadBuilder, ThreadConfig, ThreadCore, ThreadState, LOWEST_PRIORITY,
};

mock! {
    pub Bridge {}

    impl SchedulerBridge for Bridge {
        fn current_thread(&self) -> Option<ThreadId>;
        fn current_cpu(&self) -> CpuId;
        fn start(&self, thread: ThreadId, entry: ThreadStart);
        fn make_ready(&self, thread: ThreadId);
        fn block_current(&self);
        fn reschedule(&self);
        fn yield_current(&self);
        fn preempt_current(&self);
        fn exit_current(&self, handoff: ExitHandoff);
        fn schedule_reclaim(&self);
        fn send_reschedule_ipi(&self, cpu: CpuId);
        fn disable_interrupts(&self) -> IrqState;
        fn restore_interrupts(&self, state: IrqState);
    }
}

mock! {
    pub Clock {}

    impl TimerQueue for Clock {
        fn now(&self) -> Nanoseconds;
        fn arm(&self, deadline: Deadline, slack: TimerSlack, callback: TimerCallback) -> TimerHandle;
        fn cancel(&self, timer: TimerHandle) -> bool;
    }
}

/// Where the mocked bridge says it is running
#[derive(Default)]
struct Position {
    cpu: AtomicU32,
    /// Raw id of the current thread, 0 for none
    thread: AtomicU64,
}

impl Position {
    fn set(&self, cpu: CpuId, thread: Option<ThreadId>) {
        self.cpu.store(cpu, Ordering::SeqCst);
        self.thread
            .store(thread.map_or(0, ThreadId::as_u64), Ordering::SeqCst);
    }
}

/// Bridge whose lock and position queries always succeed
fn bridge_at(position: &Arc<Position>) -> MockBridge {
    let mut bridge = MockBridge::new();
    bridge
        .expect_disable_interrupts()
        .returning(IrqState::default);
    bridge.expect_restore_interrupts().return_const(());
    let cpu = Arc::clone(position);
    bridge
        .expect_current_cpu()
        .returning(move || cpu.cpu.load(Ordering::SeqCst));
    let thread = Arc::clone(position);
    bridge.expect_current_thread().returning(move || {
        match thread.thread.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(ThreadId::new(raw)),
        }
    });
    bridge
}

fn clock() -> MockClock {
    let mut clock = MockClock::new();
    clock.expect_now().return_const(1_000_000u64);
    clock
}

fn core_with(bridge: MockBridge) -> Arc<ThreadCore> {
    ThreadCore::new(ThreadConfig::default(), Arc::new(bridge), Arc::new(clock())).unwrap()
}

#[test]
fn test_resume_starts_initial_thread_once() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    bridge
        .expect_start()
        .with(eq(ThreadId::new(1)), always())
        .times(1)
        .return_const(());
    let core = core_with(bridge);

    let thread = core.create("worker", 10, || 0).unwrap();
    assert_eq!(thread, ThreadId::new(1));
    assert_eq!(core.resume(thread), Ok(()));
    assert_eq!(core.thread_state(thread), Ok(ThreadState::Ready));

    // Already admitted; nothing to start
    assert_eq!(core.resume(thread), Ok(()));
}

#[test]
fn test_lock_disables_then_restores_interrupts() {
    let mut bridge = MockBridge::new();
    let mut seq = Sequence::new();
    bridge
        .expect_disable_interrupts()
        .times(1)
        .in_sequence(&mut seq)
        .return_const(IrqState { were_enabled: true });
    bridge
        .expect_restore_interrupts()
        .with(eq(IrqState { were_enabled: true }))
        .times(1)
        .in_sequence(&mut seq)
        .return_const(());
    let core = core_with(bridge);

    assert!(core.is_empty());
}

#[test]
fn test_signals_nudge_only_remote_cpus() {
    let position = Arc::new(Position::default());
    position.set(3, None);
    let mut bridge = bridge_at(&position);
    bridge
        .expect_send_reschedule_ipi()
        .with(eq(3))
        .times(1)
        .return_const(());
    let core = core_with(bridge);
    let boot = core.construct_first("bootstrap").unwrap();
    assert_eq!(core.thread_info(boot).unwrap().last_cpu, Some(3));

    // Interrupt context on the thread's own CPU
    assert_eq!(core.suspend(boot), Ok(()));

    position.set(0, None);
    assert_eq!(core.kill(boot, false), Ok(()));
    assert_eq!(core.thread_state(boot), Ok(ThreadState::Running));
}

#[test]
fn test_relinquish_routes_to_matching_bridge_call() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    bridge.expect_yield_current().times(1).return_const(());
    bridge.expect_preempt_current().times(1).return_const(());
    bridge.expect_reschedule().times(1).return_const(());
    let core = core_with(bridge);
    let boot = core.construct_first("bootstrap").unwrap();
    position.set(0, Some(boot));

    core.yield_current();
    core.preempt();
    core.reschedule();
    assert_eq!(core.thread_state(boot), Ok(ThreadState::Running));
}

#[test]
fn test_relinquish_without_current_thread_does_nothing() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    bridge.expect_yield_current().never();
    bridge.expect_reschedule().never();
    let core = core_with(bridge);

    core.yield_current();
    core.reschedule();
}

#[test]
fn test_idle_thread_is_started_pinned_and_protected() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    bridge.expect_start().times(1).return_const(());
    bridge.expect_send_reschedule_ipi().never();
    let core = core_with(bridge);

    let idle = core.create_idle(2, || 0).unwrap();
    let info = core.thread_info(idle).unwrap();
    assert_eq!(info.name.as_str(), "idle-2");
    assert_eq!(info.priority, LOWEST_PRIORITY);
    assert_eq!(core.sched_attrs(idle).unwrap().pinned_cpu, Some(2));

    assert_eq!(core.suspend(idle), Err(KernelError::BadState));
    assert_eq!(core.kill(idle, true), Err(KernelError::BadState));
}

#[test]
#[should_panic(expected = "ran again after exit")]
fn test_exit_requires_bridge_to_switch_away() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    bridge.expect_exit_current().times(1).return_const(());
    let core = core_with(bridge);
    let boot = core.construct_first("bootstrap").unwrap();
    position.set(0, Some(boot));

    core.exit(0);
}

#[test]
fn test_detached_self_exit_wakes_reclaim_worker_once() {
    let position = Arc::new(Position::default());
    let mut bridge = bridge_at(&position);
    let entry: Arc<Mutex<Option<ThreadStart>>> = Arc::default();
    let slot = Arc::clone(&entry);
    bridge
        .expect_start()
        .times(1)
        .returning(move |_, start| *slot.lock().unwrap() = Some(start));
    bridge.expect_schedule_reclaim().times(1).return_const(());
    // Dropping the handoff releases the lock; the core then sees the
    // thread come back and panics
    bridge.expect_exit_current().times(1).return_const(());
    let core = core_with(bridge);

    let thread = ThreadBuilder::new()
        .name("fire-and-forget")
        .detached(true)
        .spawn(&core, || 0)
        .unwrap();
    assert_eq!(core.resume(thread), Ok(()));

    position.set(1, Some(thread));
    let start = entry.lock().unwrap().take().unwrap();
    assert!(panic::catch_unwind(AssertUnwindSafe(start)).is_err());
    position.set(0, None);

    assert!(!core.contains(thread));
    assert_eq!(core.pending_reclaims(), 1);
    assert_eq!(core.run_deferred_reclaim(), 1);
    assert_eq!(core.stats().stacks_released, 1);
}
