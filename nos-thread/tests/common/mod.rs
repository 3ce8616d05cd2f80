//! Common test utilities for thread core integration tests
//!
//! Kernel threads are backed by host threads: the scheduler bridge parks and
//! unparks them with permits, and a dead thread unwinds out of its host
//! thread. Time only moves when a test advances the manual timer.

#![allow(dead_code)]

use std::any::Any;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nos_api::{
    CpuId, Deadline, ExitHandoff, Nanoseconds, SchedulerBridge, ThreadId, ThreadStart, ThreadState,
    TimerCallback, TimerEvent, TimerHandle, TimerQueue, TimerSlack,
};
use nos_thread::{ThreadBuilder, ThreadConfig, ThreadCore};

/// How long helpers wait for another thread before failing the test
pub const PATIENCE: Duration = Duration::from_secs(5);

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Unwind payload of a host thread whose kernel thread exited
pub struct ThreadExited;

/// Runs on a dying thread inside its final switch, lock still held
pub type ExitHook = Arc<dyn Fn(ThreadId) + Send + Sync>;

// ============================================================================
// Host scheduler bridge
// ============================================================================

#[derive(Default)]
struct Parker {
    permit: Mutex<bool>,
    wakeup: Condvar,
}

impl Parker {
    fn park(&self) {
        let mut permit = self.permit.lock().unwrap();
        while !*permit {
            permit = self.wakeup.wait(permit).unwrap();
        }
        *permit = false;
    }

    fn unpark(&self) {
        *self.permit.lock().unwrap() = true;
        self.wakeup.notify_all();
    }
}

/// Scheduler bridge running every kernel thread on its own host thread
#[derive(Default)]
pub struct HostScheduler {
    parkers: Mutex<HashMap<ThreadId, Arc<Parker>>>,
    started: Mutex<Vec<ThreadId>>,
    ready: Mutex<Vec<ThreadId>>,
    ipis: Mutex<Vec<CpuId>>,
    failures: Arc<Mutex<Vec<String>>>,
    hold_starts: AtomicBool,
    held: Mutex<Vec<(ThreadId, ThreadStart)>>,
    exit_hook: Mutex<Option<ExitHook>>,
    reclaim_requests: AtomicUsize,
}

impl HostScheduler {
    fn parker(&self, thread: ThreadId) -> Arc<Parker> {
        self.parkers
            .lock()
            .unwrap()
            .entry(thread)
            .or_default()
            .clone()
    }

    fn spawn_host_thread(&self, thread: ThreadId, entry: ThreadStart) {
        let failures = Arc::clone(&self.failures);
        thread::Builder::new()
            .name(format!("kthread-{}", thread.as_u64()))
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(thread)));
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    if !payload.is::<ThreadExited>() {
                        failures.lock().unwrap().push(panic_message(payload.as_ref()));
                    }
                }
            })
            .expect("failed to spawn host thread");
    }

    /// Queue started threads instead of running them until released
    pub fn hold_starts(&self, hold: bool) {
        self.hold_starts.store(hold, Ordering::SeqCst);
    }

    /// Runs every held thread
    pub fn release_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (thread, entry) in held {
            self.spawn_host_thread(thread, entry);
        }
    }

    /// Calls `hook` from every exiting thread before its handoff completes
    pub fn on_exit(&self, hook: impl Fn(ThreadId) + Send + Sync + 'static) {
        *self.exit_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Times the reclaim worker was asked to run
    pub fn reclaim_requests(&self) -> usize {
        self.reclaim_requests.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<ThreadId> {
        self.started.lock().unwrap().clone()
    }

    pub fn ready_calls(&self) -> Vec<ThreadId> {
        self.ready.lock().unwrap().clone()
    }

    pub fn ipis(&self) -> Vec<CpuId> {
        self.ipis.lock().unwrap().clone()
    }

    /// Panics raised by kernel threads other than their exit
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic".to_string()
    }
}

impl SchedulerBridge for HostScheduler {
    fn current_thread(&self) -> Option<ThreadId> {
        CURRENT.with(Cell::get)
    }

    fn current_cpu(&self) -> CpuId {
        self.current_thread().map_or(0, |thread| thread.as_u64() as CpuId)
    }

    fn start(&self, thread: ThreadId, entry: ThreadStart) {
        self.started.lock().unwrap().push(thread);
        if self.hold_starts.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push((thread, entry));
        } else {
            self.spawn_host_thread(thread, entry);
        }
    }

    fn adopt_current(&self, thread: ThreadId) {
        CURRENT.with(|current| current.set(Some(thread)));
    }

    fn make_ready(&self, thread: ThreadId) {
        self.ready.lock().unwrap().push(thread);
        self.parker(thread).unpark();
    }

    fn block_current(&self) {
        let Some(thread) = self.current_thread() else {
            panic!("block_current with no current thread");
        };
        self.parker(thread).park();
    }

    fn reschedule(&self) {
        thread::yield_now();
    }

    fn yield_current(&self) {
        thread::yield_now();
    }

    fn preempt_current(&self) {
        thread::yield_now();
    }

    fn exit_current(&self, handoff: ExitHandoff) {
        let hook = self.exit_hook.lock().unwrap().clone();
        if let (Some(hook), Some(thread)) = (hook, self.current_thread()) {
            hook(thread);
        }
        handoff.complete();
        panic::resume_unwind(Box::new(ThreadExited));
    }

    fn schedule_reclaim(&self) {
        self.reclaim_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn send_reschedule_ipi(&self, cpu: CpuId) {
        self.ipis.lock().unwrap().push(cpu);
    }
}

// ============================================================================
// Manual timer
// ============================================================================

struct ArmedTimer {
    deadline: Deadline,
    callback: TimerCallback,
    canceled: Arc<AtomicBool>,
}

#[derive(Default)]
struct TimerTable {
    next: u64,
    armed: BTreeMap<u64, ArmedTimer>,
    /// Cancel flags of timers that are armed or firing
    flags: HashMap<u64, Arc<AtomicBool>>,
    slacks: Vec<TimerSlack>,
}

/// Timer queue whose clock only moves in [`ManualTimer::advance`]
pub struct ManualTimer {
    now: AtomicU64,
    table: Mutex<TimerTable>,
}

impl ManualTimer {
    pub const START: Nanoseconds = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(Self::START),
            table: Mutex::new(TimerTable::default()),
        }
    }

    /// Moves the clock forward and fires every timer that came due.
    /// Returns the number fired.
    pub fn advance(&self, delta: Nanoseconds) -> usize {
        let now = self.now.fetch_add(delta, Ordering::SeqCst) + delta;
        let due: Vec<(u64, ArmedTimer)> = {
            let mut table = self.table.lock().unwrap();
            let keys: Vec<u64> = table
                .armed
                .iter()
                .filter(|(_, timer)| timer.deadline.as_nanos() <= now)
                .map(|(&key, _)| key)
                .collect();
            keys.into_iter()
                .filter_map(|key| table.armed.remove(&key).map(|timer| (key, timer)))
                .collect()
        };

        let fired = due.len();
        for (key, timer) in due {
            let event = TimerEvent::new(now, &timer.canceled);
            (timer.callback)(&event);
            self.table.lock().unwrap().flags.remove(&key);
        }
        fired
    }

    /// Timers armed and not yet fired or canceled
    pub fn pending(&self) -> usize {
        self.table.lock().unwrap().armed.len()
    }

    pub fn last_slack(&self) -> Option<TimerSlack> {
        self.table.lock().unwrap().slacks.last().copied()
    }
}

impl TimerQueue for ManualTimer {
    fn now(&self) -> Nanoseconds {
        self.now.load(Ordering::SeqCst)
    }

    fn arm(&self, deadline: Deadline, slack: TimerSlack, callback: TimerCallback) -> TimerHandle {
        let mut table = self.table.lock().unwrap();
        table.next += 1;
        let key = table.next;
        let canceled = Arc::new(AtomicBool::new(false));
        table.flags.insert(key, Arc::clone(&canceled));
        table.armed.insert(
            key,
            ArmedTimer {
                deadline,
                callback,
                canceled,
            },
        );
        table.slacks.push(slack);
        TimerHandle::new(key)
    }

    fn cancel(&self, timer: TimerHandle) -> bool {
        let mut table = self.table.lock().unwrap();
        if let Some(flag) = table.flags.remove(&timer.as_u64()) {
            flag.store(true, Ordering::Release);
        }
        table.armed.remove(&timer.as_u64()).is_some()
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A thread core on host collaborators, with the test thread adopted as
/// the boot thread
pub struct Harness {
    pub core: Arc<ThreadCore>,
    pub scheduler: Arc<HostScheduler>,
    pub timer: Arc<ManualTimer>,
    pub boot: ThreadId,
}

pub fn harness() -> Harness {
    harness_with(ThreadConfig::default())
}

pub fn harness_with(config: ThreadConfig) -> Harness {
    let scheduler = Arc::new(HostScheduler::default());
    let timer = Arc::new(ManualTimer::new());
    let core = ThreadCore::new(config, scheduler.clone(), timer.clone()).expect("valid config");
    let boot = core.construct_first("bootstrap").expect("boot thread");
    Harness {
        core,
        scheduler,
        timer,
        boot,
    }
}

impl Harness {
    /// Creates and resumes a thread running `body`
    pub fn start<F>(&self, name: &str, body: F) -> ThreadId
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        self.start_with(ThreadBuilder::new().name(name), body)
    }

    pub fn start_with<F>(&self, builder: ThreadBuilder, body: F) -> ThreadId
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let thread = builder.spawn(&self.core, body).expect("spawn");
        self.core.resume(thread).expect("resume");
        thread
    }

    /// Waits until `thread` reaches `state`
    pub fn wait_for_state(&self, thread: ThreadId, state: ThreadState) {
        let core = Arc::clone(&self.core);
        wait_until(&format!("{} to be {}", thread, state), || {
            core.thread_state(thread) == Ok(state)
        });
    }

    /// Waits until `thread` has no registry entry
    pub fn wait_for_removal(&self, thread: ThreadId) {
        let core = Arc::clone(&self.core);
        wait_until(&format!("{} to be removed", thread), || !core.contains(thread));
    }

    pub fn deadline_in(&self, delay: Nanoseconds) -> Deadline {
        Deadline::after(self.timer.now(), delay)
    }

    pub fn assert_consistent(&self) {
        assert_eq!(self.core.audit(), Ok(()));
        assert!(self.scheduler.failures().is_empty(), "{:?}", self.scheduler.failures());
    }
}

/// Polls `condition` until it holds
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > PATIENCE {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(1));
    }
}
