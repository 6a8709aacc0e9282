//! Periodic pool maintenance
//!
//! Each pool owns one [`Evictor`]. The evictor keeps at most one task
//! registered with the shared [`EvictionTimer`] and swaps it out atomically
//! whenever the interval changes. Every run evicts idle objects and then tops
//! the pool back up to its minimum idle count.

use crate::context::FactoryContext;
use crate::errors::PoolResult;
use crate::timer::{panic_message, EvictionTimer, TimerHandle, TimerTask};

use parking_lot::ReentrantMutex;
use scopeguard::defer;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Maintenance routines a concrete pool provides
///
/// Both routines report their own failures (usually through
/// [`PoolCore::swallow_error`](crate::PoolCore::swallow_error)) before
/// returning. The evictor ignores returned errors and traps panics.
pub trait Maintenance: Send + Sync {
    /// Examine idle objects and destroy the ones the eviction policy selects
    fn evict(&self) -> PoolResult<()>;

    /// Create idle objects until the configured minimum is met
    fn ensure_min_idle(&self) -> PoolResult<()>;
}

#[derive(Default)]
struct EvictorState {
    target: Option<Weak<dyn Maintenance>>,
    interval: Duration,
    active: Option<ActiveTask>,
    generation: u64,
    stopped: bool,
}

struct ActiveTask {
    handle: TimerHandle,
    generation: u64,
}

/// Lock serialising schedule changes with runs.
///
/// Re-entrant so a maintenance routine may change the schedule of its own pool.
type SchedulerLock = ReentrantMutex<RefCell<EvictorState>>;

pub(crate) struct Evictor {
    timer: Arc<dyn EvictionTimer>,
    factory_context: Option<FactoryContext>,
    state: Arc<SchedulerLock>,
}

impl Evictor {
    pub(crate) fn new(timer: Arc<dyn EvictionTimer>, factory_context: Option<FactoryContext>) -> Self {
        Self {
            timer,
            factory_context,
            state: Arc::new(ReentrantMutex::new(RefCell::new(EvictorState::default()))),
        }
    }

    /// Bind the routines to run and apply the current interval
    pub(crate) fn attach(&self, target: Weak<dyn Maintenance>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.stopped {
            trace!("ignoring attach to a stopped evictor");
            return;
        }
        state.target = Some(target);
        self.reschedule(&mut state);
    }

    /// Change the interval; zero stops the evictor
    pub(crate) fn set_interval(&self, interval: Duration) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.interval = interval;
        self.reschedule(&mut state);
    }

    pub(crate) fn interval(&self) -> Duration {
        self.state.lock().borrow().interval
    }

    /// Cancel the task and forget the routines for good.
    ///
    /// Later interval changes are only recorded and later attaches are ignored.
    pub(crate) fn stop(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.stopped = true;
        state.target = None;
        self.cancel_active(&mut state);
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.state.lock().borrow().active.is_some()
    }

    fn reschedule(&self, state: &mut EvictorState) {
        self.cancel_active(state);

        if state.stopped || state.interval.is_zero() {
            return;
        }
        let Some(target) = state.target.clone() else {
            return;
        };

        state.generation += 1;
        let task = Arc::new(EvictorTask {
            state: Arc::downgrade(&self.state),
            generation: state.generation,
            target,
            factory_context: self.factory_context.clone(),
        });

        let handle = self.timer.schedule(task, state.interval);
        debug!(
            generation = state.generation,
            interval = ?state.interval,
            "evictor scheduled"
        );
        state.active = Some(ActiveTask {
            handle,
            generation: state.generation,
        });
    }

    fn cancel_active(&self, state: &mut EvictorState) {
        if let Some(active) = state.active.take() {
            self.timer.cancel(active.handle);
            debug!(generation = active.generation, "evictor cancelled");
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EvictorTask {
    state: Weak<SchedulerLock>,
    generation: u64,
    target: Weak<dyn Maintenance>,
    factory_context: Option<FactoryContext>,
}

impl TimerTask for EvictorTask {
    fn run(&self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let guard = state.lock();

        // A run that lost the race against a cancel must not touch the pool.
        let current = guard.borrow().active.as_ref().map(|active| active.generation);
        if current != Some(self.generation) {
            trace!(generation = self.generation, "skipping run of a replaced evictor");
            return;
        }

        let Some(target) = self.target.upgrade() else {
            return;
        };
        run_maintenance(target.as_ref(), self.factory_context.clone());

        drop(target);
        drop(guard);
    }
}

/// One maintenance run: evict, then replenish, under the factory's context
pub(crate) fn run_maintenance(target: &dyn Maintenance, context: Option<FactoryContext>) {
    let saved = FactoryContext::replace(context);
    defer! {
        FactoryContext::replace(saved);
    }

    match panic::catch_unwind(AssertUnwindSafe(|| target.evict())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(error = %e, "eviction failed"),
        Err(payload) => error!(
            panic_message = %panic_message(payload.as_ref()),
            "eviction panicked; evictor keeps running"
        ),
    }

    match panic::catch_unwind(AssertUnwindSafe(|| target.ensure_min_idle())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(error = %e, "replenishing idle objects failed"),
        Err(payload) => error!(
            panic_message = %panic_message(payload.as_ref()),
            "replenishing idle objects panicked; evictor keeps running"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PoolError;
    use crate::timer::SharedTimer;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        evictions: AtomicUsize,
        replenishments: AtomicUsize,
        fail_evict: bool,
        panic_evict: bool,
        contexts: Mutex<Vec<Option<u32>>>,
    }

    impl Maintenance for Recorder {
        fn evict(&self) -> PoolResult<()> {
            self.evictions.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().push(
                FactoryContext::current().and_then(|c| c.downcast_ref::<u32>().copied()),
            );
            if self.panic_evict {
                panic!("evict exploded");
            }
            if self.fail_evict {
                return Err(PoolError::Eviction("destroy failed".to_string()));
            }
            Ok(())
        }

        fn ensure_min_idle(&self) -> PoolResult<()> {
            self.replenishments.fetch_add(1, Ordering::SeqCst);
            Err(PoolError::Factory("no capacity".to_string()))
        }
    }

    fn evictor() -> (Arc<SharedTimer>, Evictor) {
        let timer = Arc::new(SharedTimer::new());
        let evictor = Evictor::new(timer.clone(), Some(FactoryContext::new(7_u32)));
        (timer, evictor)
    }

    fn attach(evictor: &Evictor, recorder: &Arc<Recorder>) {
        let weak: Weak<dyn Maintenance> = Arc::downgrade(recorder) as Weak<dyn Maintenance>;
        evictor.attach(weak);
    }

    #[test]
    fn test_run_isolates_routines_and_restores_context() {
        let recorder = Recorder {
            panic_evict: true,
            ..Default::default()
        };

        let _ = FactoryContext::replace(None);
        run_maintenance(&recorder, Some(FactoryContext::new(3_u32)));

        assert_eq!(recorder.evictions.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.replenishments.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.contexts.lock(), vec![Some(3)]);
        assert!(FactoryContext::current().is_none());
    }

    #[test]
    fn test_attach_without_interval_stays_stopped() {
        let (timer, evictor) = evictor();
        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);

        assert!(!evictor.is_scheduled());
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_interval_before_attach_is_applied_on_attach() {
        let (timer, evictor) = evictor();
        evictor.set_interval(Duration::from_millis(10));
        assert!(!evictor.is_scheduled());

        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);
        assert!(evictor.is_scheduled());
        assert_eq!(timer.scheduled_count(), 1);
    }

    #[test]
    fn test_ticks_survive_failing_routines() {
        let (_timer, evictor) = evictor();
        let recorder = Arc::new(Recorder {
            fail_evict: true,
            ..Default::default()
        });
        attach(&evictor, &recorder);
        evictor.set_interval(Duration::from_millis(10));

        thread::sleep(Duration::from_millis(300));
        evictor.set_interval(Duration::ZERO);

        let evictions = recorder.evictions.load(Ordering::SeqCst);
        assert!(evictions >= 3);
        assert_eq!(recorder.replenishments.load(Ordering::SeqCst), evictions);
        assert!(recorder.contexts.lock().iter().all(|c| *c == Some(7)));
    }

    #[test]
    fn test_rescheduling_keeps_a_single_task() {
        let (timer, evictor) = evictor();
        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);

        for millis in [50, 20, 30, 10] {
            evictor.set_interval(Duration::from_millis(millis));
            assert_eq!(timer.scheduled_count(), 1);
        }
        assert_eq!(evictor.interval(), Duration::from_millis(10));

        evictor.set_interval(Duration::ZERO);
        assert_eq!(timer.scheduled_count(), 0);
        assert!(!evictor.is_scheduled());
    }

    #[test]
    fn test_no_ticks_after_stopping() {
        let (_timer, evictor) = evictor();
        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);

        evictor.set_interval(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(50));
        evictor.set_interval(Duration::ZERO);

        let evictions = recorder.evictions.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.evictions.load(Ordering::SeqCst), evictions);
    }

    #[test]
    fn test_dropped_target_is_not_run() {
        let (timer, evictor) = evictor();
        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);
        evictor.set_interval(Duration::from_millis(5));
        drop(recorder);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(timer.scheduled_count(), 1);
        drop(evictor);
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_attach_after_stop_stays_stopped() {
        let (timer, evictor) = evictor();
        evictor.set_interval(Duration::from_millis(5));
        evictor.stop();

        let recorder = Arc::new(Recorder::default());
        attach(&evictor, &recorder);
        evictor.set_interval(Duration::from_millis(2));

        thread::sleep(Duration::from_millis(50));
        assert!(!evictor.is_scheduled());
        assert_eq!(timer.scheduled_count(), 0);
        assert_eq!(recorder.evictions.load(Ordering::SeqCst), 0);
        assert_eq!(evictor.interval(), Duration::from_millis(2));
    }

    struct SelfStopping {
        evictor: Mutex<Option<Arc<Evictor>>>,
        runs: AtomicUsize,
    }

    impl Maintenance for SelfStopping {
        fn evict(&self) -> PoolResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(evictor) = self.evictor.lock().take() {
                evictor.set_interval(Duration::ZERO);
            }
            Ok(())
        }

        fn ensure_min_idle(&self) -> PoolResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_routine_may_stop_its_own_evictor() {
        let timer = Arc::new(SharedTimer::new());
        let evictor = Arc::new(Evictor::new(timer.clone(), None));
        let target = Arc::new(SelfStopping {
            evictor: Mutex::new(Some(Arc::clone(&evictor))),
            runs: AtomicUsize::new(0),
        });
        evictor.attach(Arc::downgrade(&target) as Weak<dyn Maintenance>);
        evictor.set_interval(Duration::from_millis(5));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(target.runs.load(Ordering::SeqCst), 1);
        assert!(!evictor.is_scheduled());
        assert_eq!(timer.scheduled_count(), 0);
    }
}
