// # Purge Scheduling
//
// The per-pool purge worker is a delayed task handed to an executor. Two
// seams keep the aging logic testable:
//
// - `Clock` supplies "now" for object timestamps and age checks.
//   `SystemClock` reads the monotonic clock; `VirtualClock` is advanced
//   explicitly by tests.
// - `DelayedExecutor` runs a task after a delay. `TimerExecutor` is the
//   production implementation (dedicated worker thread over a deadline
//   heap); `ManualExecutor` runs due tasks inline when its shared virtual
//   clock is advanced.
//
// `cancel_sync` removes a pending task and, if the task is mid-execution,
// waits for it to finish; pool teardown relies on that guarantee.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Time source for timestamps and age checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic aging tests.
pub struct VirtualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.offset.lock() += delta;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// A unit of delayed work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Identifies a scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Delayed-task executor seam.
pub trait DelayedExecutor: Send + Sync {
    /// Enqueues `task` to run once, `after` from now.
    fn schedule(&self, after: Duration, task: Task) -> TaskHandle;

    /// Drops the task if it has not started; if it is currently running,
    /// waits for the execution to complete before returning.
    fn cancel_sync(&self, handle: TaskHandle);
}

struct Scheduled {
    deadline: Instant,
    id: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Scheduled>,
    running: Option<u64>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    next_id: AtomicU64,
}

/// Production executor: one worker thread draining a deadline heap.
pub struct TimerExecutor {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerExecutor {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
            next_id: AtomicU64::new(1),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("sgv-purge-timer".into())
            .spawn(move || Self::worker_loop(worker_shared))
            .expect("failed to spawn purge timer thread");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn worker_loop(shared: Arc<TimerShared>) {
        loop {
            let due = {
                let mut state = shared.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    match state.queue.peek() {
                        None => {
                            shared.cond.wait(&mut state);
                        }
                        Some(next) if next.deadline <= now => {
                            let due = state.queue.pop().unwrap();
                            state.running = Some(due.id);
                            break due;
                        }
                        Some(next) => {
                            let wait = next.deadline - now;
                            let _ = shared.cond.wait_for(&mut state, wait);
                        }
                    }
                }
            };
            (due.task)();
            let mut state = shared.state.lock();
            state.running = None;
            shared.cond.notify_all();
        }
    }
}

impl Default for TimerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedExecutor for TimerExecutor {
    fn schedule(&self, after: Duration, task: Task) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            state.queue.push(Scheduled {
                deadline: Instant::now() + after,
                id,
                task,
            });
        }
        self.shared.cond.notify_all();
        trace!(id, ?after, "scheduled delayed task");
        TaskHandle(id)
    }

    fn cancel_sync(&self, handle: TaskHandle) {
        let mut state = self.shared.state.lock();
        state.queue.retain(|s| s.id != handle.0);
        while state.running == Some(handle.0) {
            self.shared.cond.wait(&mut state);
        }
    }
}

impl Drop for TimerExecutor {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

struct ManualState {
    pending: Vec<(Instant, u64, Task)>,
    next_id: u64,
}

/// Deterministic executor for tests: tasks run inline, in deadline order,
/// when [`ManualExecutor::advance`] moves the shared virtual clock past
/// their deadline.
pub struct ManualExecutor {
    clock: Arc<VirtualClock>,
    state: Mutex<ManualState>,
}

impl ManualExecutor {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ManualState {
                pending: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Advances the virtual clock and runs every task that became due.
    /// Tasks may schedule follow-up work; newly due tasks run in the same
    /// call.
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
        loop {
            let task = {
                let now = self.clock.now();
                let mut state = self.state.lock();
                let due = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, (deadline, _, _))| *deadline <= now)
                    .min_by_key(|(_, (deadline, id, _))| (*deadline, *id))
                    .map(|(i, _)| i);
                match due {
                    Some(i) => state.pending.remove(i).2,
                    None => break,
                }
            };
            task();
        }
    }

    /// Number of tasks waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl DelayedExecutor for ManualExecutor {
    fn schedule(&self, after: Duration, task: Task) -> TaskHandle {
        let deadline = self.clock.now() + after;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push((deadline, id, task));
        TaskHandle(id)
    }

    fn cancel_sync(&self, handle: TaskHandle) {
        // Tasks only run inside `advance`, on the driving thread, so a
        // pending removal is always enough.
        self.state.lock().pending.retain(|(_, id, _)| *id != handle.0);
    }
}
