//! Shared core of concrete pool implementations

use crate::config::PoolConfiguration;
use crate::context::FactoryContext;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionConfig, EvictionPolicy};
use crate::evictor::{Evictor, Maintenance};
use crate::journal::{render_error, SwallowedErrors};
use crate::metrics::{DestroyCause, MetricsExporter, PoolMetrics, PoolStats};
use crate::notification::{
    ListenerId, NotificationFilter, NotificationInfo, NotificationListener, NotificationRelay,
};
use crate::timer::{EvictionTimer, SharedTimer};

use parking_lot::RwLock;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_POOL_NAME: &str = "pool";

struct Settings {
    max_total: Option<usize>,
    block_when_exhausted: bool,
    max_wait: Option<Duration>,
    lifo: bool,
    test_on_borrow: bool,
    test_on_return: bool,
    test_while_idle: bool,
    num_tests_per_eviction_run: i32,
    min_evictable_idle_time: Duration,
    soft_min_evictable_idle_time: Option<Duration>,
    eviction_policy: Option<Arc<dyn EvictionPolicy>>,
}

/// State, telemetry and maintenance scheduling shared by concrete pools.
///
/// A concrete pool embeds a `PoolCore`, implements [`Maintenance`] and calls
/// [`attach`](Self::attach) once it lives in an `Arc`. From then on the evictor
/// runs the pool's maintenance on the configured interval.
///
/// # Examples
///
/// ```
/// use esox_poolcore::{Maintenance, PoolConfiguration, PoolCore, PoolResult};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// struct ConnectionPool {
///     core: PoolCore,
/// }
///
/// impl Maintenance for ConnectionPool {
///     fn evict(&self) -> PoolResult<()> {
///         self.core.assert_open()
///     }
///
///     fn ensure_min_idle(&self) -> PoolResult<()> {
///         Ok(())
///     }
/// }
///
/// let config = PoolConfiguration::new().with_time_between_eviction_runs(Duration::from_secs(60));
/// let pool = Arc::new(ConnectionPool { core: PoolCore::new(config) });
/// pool.core.attach(&pool);
/// assert!(pool.core.is_evictor_scheduled());
///
/// pool.core.update_stats_borrow(Duration::from_millis(50), Duration::from_millis(10));
/// assert_eq!(pool.core.borrowed_count(), 1);
///
/// pool.core.close();
/// assert!(!pool.core.is_evictor_scheduled());
/// ```
pub struct PoolCore {
    name: String,
    creation_context: Backtrace,
    closed: AtomicBool,
    settings: RwLock<Settings>,
    stats: PoolStats,
    swallowed: SwallowedErrors,
    notifications: NotificationRelay,
    evictor: Evictor,
}

impl PoolCore {
    pub fn new(config: PoolConfiguration) -> Self {
        let name = config
            .name
            .unwrap_or_else(|| DEFAULT_POOL_NAME.to_string());

        let notifications = if config.monitoring_enabled {
            NotificationRelay::enabled(name.clone())
        } else {
            NotificationRelay::disabled()
        };

        let timer: Arc<dyn EvictionTimer> = match config.timer {
            Some(timer) => timer,
            None => SharedTimer::global(),
        };
        let factory_context = config.factory_context.or_else(FactoryContext::current);

        let evictor = Evictor::new(timer, factory_context);
        evictor.set_interval(config.time_between_eviction_runs);

        Self {
            creation_context: Backtrace::force_capture(),
            closed: AtomicBool::new(false),
            settings: RwLock::new(Settings {
                max_total: config.max_total,
                block_when_exhausted: config.block_when_exhausted,
                max_wait: config.max_wait,
                lifo: config.lifo,
                test_on_borrow: config.test_on_borrow,
                test_on_return: config.test_on_return,
                test_while_idle: config.test_while_idle,
                num_tests_per_eviction_run: config.num_tests_per_eviction_run,
                min_evictable_idle_time: config.min_evictable_idle_time,
                soft_min_evictable_idle_time: config.soft_min_evictable_idle_time,
                eviction_policy: config.eviction_policy,
            }),
            stats: PoolStats::new(),
            swallowed: SwallowedErrors::new(),
            notifications,
            evictor,
            name,
        }
    }

    /// Bind the pool whose maintenance the evictor runs.
    ///
    /// The pool is held weakly; once it is dropped its runs become no-ops.
    /// Attaching a closed pool does nothing.
    pub fn attach<M: Maintenance + 'static>(&self, pool: &Arc<M>) {
        let target: Weak<M> = Arc::downgrade(pool);
        self.evictor.attach(target);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backtrace of the call that built this pool, for finding pools that are never closed.
    ///
    /// Always captured, regardless of `RUST_BACKTRACE`; symbols are resolved
    /// when this is first rendered.
    pub fn creation_context(&self) -> &Backtrace {
        &self.creation_context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn assert_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    /// Mark the pool closed and stop its evictor.
    ///
    /// Returns `false` if the pool was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.evictor.stop();
        debug!(pool = %self.name, "pool closed");
        true
    }

    /// Record an error that maintenance could not report to a caller
    pub fn swallow_error(&self, error: &(dyn Error + 'static)) {
        let message = render_error(error);
        let sequence = self.stats.on_swallowed();
        warn!(pool = %self.name, sequence, error = %message, "swallowed error");

        self.notifications.emit_swallowed(sequence, &message);
        self.swallowed.record_message(message);
    }

    /// Most recent swallowed errors, oldest first; unused slots are `None`
    pub fn get_swallowed_errors(&self) -> Vec<Option<String>> {
        self.swallowed.snapshot()
    }

    // Telemetry

    pub fn update_stats_borrow(&self, idle: Duration, wait: Duration) {
        self.stats.on_borrow(idle, wait);
    }

    pub fn update_stats_return(&self, active: Duration) {
        self.stats.on_return(active);
    }

    pub fn on_create(&self) {
        self.stats.on_create();
    }

    pub fn on_destroy(&self, cause: DestroyCause) {
        self.stats.on_destroy(cause);
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn borrowed_count(&self) -> u64 {
        self.stats.borrowed_count()
    }

    pub fn returned_count(&self) -> u64 {
        self.stats.returned_count()
    }

    pub fn created_count(&self) -> u64 {
        self.stats.created_count()
    }

    pub fn destroyed_count(&self) -> u64 {
        self.stats.destroyed_count()
    }

    pub fn destroyed_by_evictor_count(&self) -> u64 {
        self.stats.destroyed_by_evictor_count()
    }

    pub fn destroyed_by_borrow_validation_count(&self) -> u64 {
        self.stats.destroyed_by_borrow_validation_count()
    }

    pub fn mean_active_time_millis(&self) -> u64 {
        self.stats.mean_active_time_millis()
    }

    pub fn mean_idle_time_millis(&self) -> u64 {
        self.stats.mean_idle_time_millis()
    }

    pub fn mean_borrow_wait_time_millis(&self) -> u64 {
        self.stats.mean_borrow_wait_time_millis()
    }

    pub fn get_max_borrow_wait_time_millis(&self) -> u64 {
        self.stats.max_borrow_wait_time_millis()
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.stats.snapshot()
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format, labelled with the pool name
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.get_metrics(), &self.name, tags)
    }

    // Notifications

    pub fn add_notification_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
    ) -> PoolResult<ListenerId> {
        self.notifications.add_listener(listener, filter)
    }

    pub fn remove_notification_listener(&self, id: ListenerId) -> PoolResult<()> {
        self.notifications.remove_listener(id)
    }

    pub fn remove_notification_listener_instance(
        &self,
        listener: &Arc<dyn NotificationListener>,
    ) -> PoolResult<usize> {
        self.notifications.remove_listener_instance(listener)
    }

    pub fn get_notification_info(&self) -> PoolResult<Vec<NotificationInfo>> {
        self.notifications.notification_info()
    }

    // Evictor

    pub fn time_between_eviction_runs(&self) -> Duration {
        self.evictor.interval()
    }

    /// Start, reschedule or (with zero) stop the evictor.
    ///
    /// On a closed pool the value is only recorded.
    pub fn set_time_between_eviction_runs(&self, interval: Duration) {
        self.evictor.set_interval(interval);
    }

    pub fn is_evictor_scheduled(&self) -> bool {
        self.evictor.is_scheduled()
    }

    pub fn eviction_policy(&self) -> Option<Arc<dyn EvictionPolicy>> {
        self.settings.read().eviction_policy.clone()
    }

    pub fn set_eviction_policy(&self, policy: Option<Arc<dyn EvictionPolicy>>) {
        self.settings.write().eviction_policy = policy;
    }

    /// Thresholds to hand to the eviction policy during a run
    pub fn eviction_config(&self, min_idle: usize) -> EvictionConfig {
        let settings = self.settings.read();
        EvictionConfig::new(
            settings.min_evictable_idle_time,
            settings.soft_min_evictable_idle_time,
            min_idle,
        )
    }

    /// Idle objects to examine in one run when `idle_count` are idle
    pub fn num_tests(&self, idle_count: usize) -> usize {
        let tests = self.settings.read().num_tests_per_eviction_run;
        if tests >= 0 {
            (tests as usize).min(idle_count)
        } else {
            idle_count.div_ceil(tests.unsigned_abs() as usize)
        }
    }

    // Settings

    pub fn max_total(&self) -> Option<usize> {
        self.settings.read().max_total
    }

    pub fn set_max_total(&self, max_total: Option<usize>) {
        self.settings.write().max_total = max_total;
    }

    pub fn block_when_exhausted(&self) -> bool {
        self.settings.read().block_when_exhausted
    }

    pub fn set_block_when_exhausted(&self, block: bool) {
        self.settings.write().block_when_exhausted = block;
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.settings.read().max_wait
    }

    pub fn set_max_wait(&self, max_wait: Option<Duration>) {
        self.settings.write().max_wait = max_wait;
    }

    pub fn lifo(&self) -> bool {
        self.settings.read().lifo
    }

    pub fn set_lifo(&self, lifo: bool) {
        self.settings.write().lifo = lifo;
    }

    pub fn test_on_borrow(&self) -> bool {
        self.settings.read().test_on_borrow
    }

    pub fn set_test_on_borrow(&self, test: bool) {
        self.settings.write().test_on_borrow = test;
    }

    pub fn test_on_return(&self) -> bool {
        self.settings.read().test_on_return
    }

    pub fn set_test_on_return(&self, test: bool) {
        self.settings.write().test_on_return = test;
    }

    pub fn test_while_idle(&self) -> bool {
        self.settings.read().test_while_idle
    }

    pub fn set_test_while_idle(&self, test: bool) {
        self.settings.write().test_while_idle = test;
    }

    pub fn num_tests_per_eviction_run(&self) -> i32 {
        self.settings.read().num_tests_per_eviction_run
    }

    pub fn set_num_tests_per_eviction_run(&self, tests: i32) {
        self.settings.write().num_tests_per_eviction_run = tests;
    }

    pub fn min_evictable_idle_time(&self) -> Duration {
        self.settings.read().min_evictable_idle_time
    }

    pub fn set_min_evictable_idle_time(&self, idle: Duration) {
        self.settings.write().min_evictable_idle_time = idle;
    }

    pub fn soft_min_evictable_idle_time(&self) -> Option<Duration> {
        self.settings.read().soft_min_evictable_idle_time
    }

    pub fn set_soft_min_evictable_idle_time(&self, idle: Option<Duration>) {
        self.settings.write().soft_min_evictable_idle_time = idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Notification;
    use crate::tokio_timer::TokioTimer;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Minimal concrete pool: idle objects are plain ids
    struct IdPool {
        core: PoolCore,
        idle: Mutex<VecDeque<u32>>,
        next_id: AtomicUsize,
        min_idle: usize,
        fail_destroy: bool,
        contexts: Mutex<Vec<Option<&'static str>>>,
    }

    impl IdPool {
        fn new(config: PoolConfiguration, min_idle: usize, fail_destroy: bool) -> Arc<Self> {
            let pool = Arc::new(Self {
                core: PoolCore::new(config),
                idle: Mutex::new(VecDeque::new()),
                next_id: AtomicUsize::new(0),
                min_idle,
                fail_destroy,
                contexts: Mutex::new(Vec::new()),
            });
            pool.core.attach(&pool);
            pool
        }

        fn destroy(&self, _id: u32) -> PoolResult<()> {
            if self.fail_destroy {
                return Err(PoolError::Factory("connection reset".to_string()));
            }
            Ok(())
        }
    }

    impl Maintenance for IdPool {
        fn evict(&self) -> PoolResult<()> {
            self.core.assert_open()?;
            self.contexts.lock().push(
                FactoryContext::current().and_then(|c| c.downcast_ref::<&'static str>().copied()),
            );

            let mut idle = self.idle.lock();
            let tests = self.core.num_tests(idle.len());
            for _ in 0..tests {
                let Some(id) = idle.pop_front() else {
                    break;
                };
                if let Err(e) = self.destroy(id) {
                    self.core.swallow_error(&e);
                }
                self.core.on_destroy(DestroyCause::Evictor);
            }
            Ok(())
        }

        fn ensure_min_idle(&self) -> PoolResult<()> {
            self.core.assert_open()?;
            let mut idle = self.idle.lock();
            while idle.len() < self.min_idle {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u32;
                idle.push_back(id);
                self.core.on_create();
            }
            Ok(())
        }
    }

    fn private_timer() -> Arc<SharedTimer> {
        Arc::new(SharedTimer::new())
    }

    #[test]
    fn test_defaults() {
        let core = PoolCore::new(PoolConfiguration::default());
        assert_eq!(core.name(), "pool");
        assert!(!core.is_closed());
        assert!(core.assert_open().is_ok());
        assert_eq!(core.max_total(), Some(8));
        assert_eq!(core.time_between_eviction_runs(), Duration::ZERO);
        assert!(!core.is_evictor_scheduled());
        assert_eq!(core.get_swallowed_errors(), vec![None; 10]);
        assert_eq!(core.get_metrics(), PoolMetrics::default());
    }

    #[test]
    fn test_borrow_scenario() {
        let core = PoolCore::new(PoolConfiguration::default());
        for wait in [10, 30, 5] {
            core.update_stats_borrow(Duration::from_millis(50), Duration::from_millis(wait));
        }

        assert_eq!(core.get_max_borrow_wait_time_millis(), 30);
        assert_eq!(core.borrowed_count(), 3);
        assert_eq!(core.mean_idle_time_millis(), 50);
    }

    #[test]
    fn test_close_is_one_way() {
        let core = PoolCore::new(PoolConfiguration::default());
        assert!(core.close());
        assert!(!core.close());
        assert!(core.is_closed());
        assert_eq!(core.assert_open(), Err(PoolError::PoolClosed));
    }

    #[test]
    fn test_monitoring_disabled_rejects_listeners() {
        let core = PoolCore::new(PoolConfiguration::new().with_monitoring(false));
        let result = core.add_notification_listener(Arc::new(|_: &Notification| {}), None);
        assert_eq!(result, Err(PoolError::MonitoringDisabled));
        assert_eq!(core.get_notification_info(), Err(PoolError::MonitoringDisabled));

        core.swallow_error(&PoolError::ValidationFailed);
        assert_eq!(core.get_swallowed_errors()[9].as_deref(), Some("Object validation failed"));
    }

    #[test]
    fn test_swallowed_errors_reach_listeners_and_journal() {
        let core = PoolCore::new(PoolConfiguration::new().with_name("orders"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.add_notification_listener(
            Arc::new(move |n: &Notification| sink.lock().push((n.sequence, n.source.clone()))),
            None,
        )
        .unwrap();

        for i in 0..12 {
            core.swallow_error(&PoolError::Factory(format!("e{i}")));
        }

        let journal = core.get_swallowed_errors();
        assert_eq!(journal.len(), 10);
        assert_eq!(journal[0].as_deref(), Some("Resource factory failed: e2"));
        assert_eq!(journal[9].as_deref(), Some("Resource factory failed: e11"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0], (1, "orders".to_string()));
        assert_eq!(seen[11].0, 12);
        assert_eq!(core.get_metrics().swallowed_error_count, 12);
    }

    #[test]
    fn test_evictor_maintains_pool() {
        let timer = private_timer();
        let config = PoolConfiguration::new()
            .with_timer(timer.clone())
            .with_factory_context(FactoryContext::new("factory"))
            .with_num_tests_per_eviction_run(-1)
            .with_time_between_eviction_runs(Duration::from_millis(10));
        let pool = IdPool::new(config, 2, true);
        assert!(pool.core.is_evictor_scheduled());

        thread::sleep(Duration::from_millis(300));
        pool.core.close();

        assert!(pool.core.created_count() >= 4);
        assert!(pool.core.destroyed_by_evictor_count() >= 2);
        assert_eq!(
            pool.core.destroyed_count(),
            pool.core.destroyed_by_evictor_count()
        );
        let newest = pool.core.get_swallowed_errors()[9].clone();
        assert_eq!(newest.as_deref(), Some("Resource factory failed: connection reset"));
        assert!(pool.contexts.lock().iter().all(|c| *c == Some("factory")));
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_context_captured_at_construction() {
        let timer = private_timer();
        let pool = {
            let _scope = FactoryContext::enter(Some(FactoryContext::new("builder")));
            IdPool::new(
                PoolConfiguration::new()
                    .with_timer(timer)
                    .with_time_between_eviction_runs(Duration::from_millis(5)),
                0,
                false,
            )
        };

        thread::sleep(Duration::from_millis(100));
        pool.core.close();

        let contexts = pool.contexts.lock();
        assert!(!contexts.is_empty());
        assert!(contexts.iter().all(|c| *c == Some("builder")));
    }

    #[test]
    fn test_creation_context_is_always_captured() {
        use std::backtrace::BacktraceStatus;

        let core = PoolCore::new(PoolConfiguration::default());
        assert_eq!(core.creation_context().status(), BacktraceStatus::Captured);

        let rendered = core.creation_context().to_string();
        assert_ne!(rendered, "disabled backtrace");
        assert!(!rendered.is_empty());
    }

    #[test]
    fn test_attach_after_close_does_not_schedule() {
        let timer = private_timer();
        let pool = IdPool::new(
            PoolConfiguration::new()
                .with_timer(timer.clone())
                .with_time_between_eviction_runs(Duration::from_millis(5)),
            1,
            false,
        );
        pool.core.close();
        pool.core.attach(&pool);

        thread::sleep(Duration::from_millis(100));
        assert!(pool.core.is_closed());
        assert!(!pool.core.is_evictor_scheduled());
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_interval_changes_after_close_are_recorded_only() {
        let timer = private_timer();
        let pool = IdPool::new(PoolConfiguration::new().with_timer(timer.clone()), 1, false);
        pool.core.close();

        pool.core.set_time_between_eviction_runs(Duration::from_millis(5));
        assert_eq!(pool.core.time_between_eviction_runs(), Duration::from_millis(5));
        assert!(!pool.core.is_evictor_scheduled());
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_zero_interval_stops_ticks() {
        let timer = private_timer();
        let pool = IdPool::new(PoolConfiguration::new().with_timer(timer.clone()), 1, false);

        pool.core.set_time_between_eviction_runs(Duration::from_millis(1));
        pool.core.set_time_between_eviction_runs(Duration::ZERO);
        let created = pool.core.created_count();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.core.created_count(), created);
        assert!(!pool.core.is_evictor_scheduled());
    }

    #[test]
    fn test_dropping_pool_cancels_its_task() {
        let timer = private_timer();
        let pool = IdPool::new(
            PoolConfiguration::new()
                .with_timer(timer.clone())
                .with_time_between_eviction_runs(Duration::from_secs(60)),
            0,
            false,
        );
        assert_eq!(timer.scheduled_count(), 1);

        drop(pool);
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_pools_share_a_timer_independently() {
        let timer = private_timer();
        let config = |interval| {
            PoolConfiguration::new()
                .with_timer(timer.clone())
                .with_time_between_eviction_runs(Duration::from_millis(interval))
        };
        let fast = IdPool::new(config(5), 1, false);
        let slow = IdPool::new(config(10), 1, false);
        assert_eq!(timer.scheduled_count(), 2);

        fast.core.close();
        assert_eq!(timer.scheduled_count(), 1);

        thread::sleep(Duration::from_millis(100));
        assert!(slow.core.created_count() >= 1);
        slow.core.close();
        assert_eq!(timer.scheduled_count(), 0);
    }

    #[test]
    fn test_num_tests() {
        let core = PoolCore::new(PoolConfiguration::new().with_num_tests_per_eviction_run(3));
        assert_eq!(core.num_tests(10), 3);
        assert_eq!(core.num_tests(2), 2);

        core.set_num_tests_per_eviction_run(-3);
        assert_eq!(core.num_tests(10), 4);
        assert_eq!(core.num_tests(0), 0);
    }

    #[test]
    fn test_eviction_config_follows_settings() {
        let core = PoolCore::new(
            PoolConfiguration::new()
                .with_min_evictable_idle_time(Duration::from_secs(5))
                .with_soft_min_evictable_idle_time(Duration::from_secs(2)),
        );
        core.set_min_evictable_idle_time(Duration::from_secs(7));

        let config = core.eviction_config(3);
        assert_eq!(config.idle_evict_time, Duration::from_secs(7));
        assert_eq!(config.idle_soft_evict_time, Some(Duration::from_secs(2)));
        assert_eq!(config.min_idle, 3);
    }

    #[test]
    fn test_prometheus_export_uses_pool_name() {
        let core = PoolCore::new(PoolConfiguration::new().with_name("cache"));
        core.on_create();
        let output = core.export_metrics_prometheus(None);
        assert!(output.contains("pool_objects_created_total{pool=\"cache\"} 1"));
        assert_eq!(core.export_metrics()["created_count"], "1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_timer_drives_evictor() {
        let timer = Arc::new(TokioTimer::current());
        let pool = IdPool::new(
            PoolConfiguration::new()
                .with_timer(timer.clone())
                .with_time_between_eviction_runs(Duration::from_millis(10)),
            3,
            false,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.core.close();

        assert!(pool.core.created_count() >= 3);
        assert_eq!(timer.scheduled_count(), 0);
    }
}
