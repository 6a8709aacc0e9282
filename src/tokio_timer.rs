//! [`EvictionTimer`] running on a tokio runtime

use crate::timer::{panic_message, EvictionTimer, TimerHandle, TimerTask, MIN_PERIOD};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::error;

/// Timer that drives each task from its own tokio interval.
///
/// Runs happen on the runtime's blocking pool, so maintenance work never
/// stalls the async workers. Runs of one task never overlap.
pub struct TokioTimer {
    runtime: Handle,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Timer bound to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Number of tasks currently registered
    pub fn scheduled_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTimer")
            .field("scheduled", &self.scheduled_count())
            .finish_non_exhaustive()
    }
}

impl EvictionTimer for TokioTimer {
    fn schedule(&self, task: Arc<dyn TimerTask>, interval: Duration) -> TimerHandle {
        let period = interval.max(MIN_PERIOD);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let join = self.runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let task = Arc::clone(&task);
                match tokio::task::spawn_blocking(move || task.run()).await {
                    Ok(()) => {}
                    Err(e) if e.is_panic() => {
                        error!(
                            task = id,
                            panic_message = %panic_message(e.into_panic().as_ref()),
                            "timer task panicked; it stays scheduled"
                        );
                    }
                    // The runtime is shutting down.
                    Err(_) => return,
                }
            }
        });

        self.tasks.lock().insert(id, join);
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = self.tasks.lock().remove(&handle.id()) {
            join.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for (_, join) in self.tasks.get_mut().drain() {
            join.abort();
        }
    }
}
