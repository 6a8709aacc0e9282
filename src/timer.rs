//! Shared periodic-task facility used by every pool's evictor

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Shortest period a timer accepts
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Work run periodically by an [`EvictionTimer`]
pub trait TimerTask: Send + Sync {
    fn run(&self);
}

/// Opaque identity of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn id(self) -> u64 {
        self.0
    }
}

/// A clock that many pools share.
///
/// `schedule` registers `task` to first run after `interval` and then every
/// `interval` after the previous run finished. `cancel` stops future runs;
/// a run already in progress is not interrupted and `cancel` does not wait
/// for it.
pub trait EvictionTimer: Send + Sync + fmt::Debug {
    fn schedule(&self, task: Arc<dyn TimerTask>, interval: Duration) -> TimerHandle;

    fn cancel(&self, handle: TimerHandle);
}

static GLOBAL: LazyLock<Arc<SharedTimer>> =
    LazyLock::new(|| Arc::new(SharedTimer::with_thread_name("pool-evictor")));

/// Timer backed by a single worker thread.
///
/// The worker starts with the first registered task and exits once the last
/// one is cancelled. Tasks run one at a time, so a slow task delays the others.
///
/// # Examples
///
/// ```
/// use esox_poolcore::{EvictionTimer, SharedTimer, TimerTask};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// struct Noop;
///
/// impl TimerTask for Noop {
///     fn run(&self) {}
/// }
///
/// let timer = SharedTimer::new();
/// let handle = timer.schedule(Arc::new(Noop), Duration::from_secs(60));
/// assert_eq!(timer.scheduled_count(), 1);
///
/// timer.cancel(handle);
/// assert_eq!(timer.scheduled_count(), 0);
/// ```
pub struct SharedTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    thread_name: String,
}

#[derive(Default)]
struct TimerState {
    tasks: HashMap<u64, Scheduled>,
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
    worker_running: bool,
}

struct Scheduled {
    task: Arc<dyn TimerTask>,
    period: Duration,
}

impl SharedTimer {
    pub fn new() -> Self {
        Self::with_thread_name("pool-timer")
    }

    pub fn with_thread_name(thread_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState::default()),
                wakeup: Condvar::new(),
                thread_name: thread_name.into(),
            }),
        }
    }

    /// The process-wide timer pools use unless configured otherwise
    pub fn global() -> Arc<SharedTimer> {
        Arc::clone(&GLOBAL)
    }

    /// Number of tasks currently registered
    pub fn scheduled_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Whether the worker thread is alive
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().worker_running
    }
}

impl Default for SharedTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedTimer")
            .field("thread_name", &self.inner.thread_name)
            .field("scheduled", &state.tasks.len())
            .field("worker_running", &state.worker_running)
            .finish()
    }
}

impl EvictionTimer for SharedTimer {
    fn schedule(&self, task: Arc<dyn TimerTask>, interval: Duration) -> TimerHandle {
        let period = interval.max(MIN_PERIOD);
        let mut state = self.inner.state.lock();

        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(id, Scheduled { task, period });
        state.queue.push(Reverse((Instant::now() + period, id)));

        if !state.worker_running {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name(self.inner.thread_name.clone())
                .spawn(move || {
                    debug!(thread = %inner.thread_name, "timer thread started");
                    worker_loop(&inner);
                    debug!(thread = %inner.thread_name, "timer thread exiting");
                });
            record_spawn(&mut state, spawned, &self.inner.thread_name);
        }

        self.inner.wakeup.notify_one();
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.inner.state.lock();
        if state.tasks.remove(&handle.id()).is_some() {
            compact_queue(&mut state);
            self.inner.wakeup.notify_one();
        }
    }
}

/// Drop queue entries of cancelled tasks once they outnumber the live ones.
///
/// Each live task has at most one queued entry.
fn compact_queue(state: &mut TimerState) {
    if state.queue.len() <= 2 * state.tasks.len() {
        return;
    }
    let TimerState { tasks, queue, .. } = state;
    queue.retain(|Reverse((_, id))| tasks.contains_key(id));
}

/// The flag only goes up for a running thread, so a failed spawn is retried by
/// the next `schedule`.
fn record_spawn(state: &mut TimerState, spawned: io::Result<JoinHandle<()>>, thread_name: &str) {
    match spawned {
        Ok(_) => state.worker_running = true,
        Err(e) => error!(
            thread = %thread_name,
            error = %e,
            "failed to spawn timer thread; tasks wait for the next schedule"
        ),
    }
}

fn worker_loop(inner: &TimerInner) {
    let mut state = inner.state.lock();

    loop {
        if state.tasks.is_empty() {
            state.queue.clear();
            state.worker_running = false;
            return;
        }

        let Some(&Reverse((due, id))) = state.queue.peek() else {
            inner.wakeup.wait(&mut state);
            continue;
        };

        // Cancelled entries may still be queued.
        let Some(scheduled) = state.tasks.get(&id) else {
            state.queue.pop();
            continue;
        };

        if due > Instant::now() {
            inner.wakeup.wait_until(&mut state, due);
            continue;
        }

        let task = Arc::clone(&scheduled.task);
        state.queue.pop();

        MutexGuard::unlocked(&mut state, move || {
            run_task(task.as_ref(), id);
            drop(task);
        });

        if let Some(scheduled) = state.tasks.get(&id) {
            let next = Instant::now() + scheduled.period;
            state.queue.push(Reverse((next, id)));
        }
    }
}

pub(crate) fn run_task(task: &dyn TimerTask, id: u64) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        error!(
            task = id,
            panic_message = %panic_message(payload.as_ref()),
            "timer task panicked; it stays scheduled"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
