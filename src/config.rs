//! Pool configuration options

use crate::context::FactoryContext;
use crate::eviction::EvictionPolicy;
use crate::timer::EvictionTimer;

use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by every pool built on [`PoolCore`](crate::PoolCore)
///
/// # Examples
///
/// ```
/// use esox_poolcore::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_name("db")
///     .with_max_total(16)
///     .with_time_between_eviction_runs(Duration::from_secs(30))
///     .with_monitoring(false);
///
/// assert_eq!(config.max_total, Some(16));
/// assert!(!config.monitoring_enabled);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Name used in notifications and metric labels
    pub name: Option<String>,

    /// Cap on objects managed by the pool; `None` for no limit
    pub max_total: Option<usize>,

    /// Whether a borrow on an exhausted pool waits instead of failing
    pub block_when_exhausted: bool,

    /// Longest a borrow waits; `None` waits indefinitely
    pub max_wait: Option<Duration>,

    /// Whether idle objects are handed out most recently returned first
    pub lifo: bool,

    /// Validate objects before they are borrowed
    pub test_on_borrow: bool,

    /// Validate objects when they are returned
    pub test_on_return: bool,

    /// Validate idle objects during eviction runs
    pub test_while_idle: bool,

    /// Pause between eviction runs; zero disables the evictor
    pub time_between_eviction_runs: Duration,

    /// Idle objects examined per eviction run. A negative value `-n` examines
    /// roughly one nth of the idle objects.
    pub num_tests_per_eviction_run: i32,

    /// Idle time after which an object may be evicted
    pub min_evictable_idle_time: Duration,

    /// Idle time after which an object may be evicted while more than the
    /// minimum idle objects remain; `None` disables the soft limit
    pub soft_min_evictable_idle_time: Option<Duration>,

    /// Whether swallowed-error notifications can be subscribed to
    pub monitoring_enabled: bool,

    /// Policy consulted by the concrete pool during eviction
    pub eviction_policy: Option<Arc<dyn EvictionPolicy>>,

    /// Context installed around eviction runs; defaults to the context current
    /// when the pool is built
    pub factory_context: Option<FactoryContext>,

    /// Timer driving the evictor; defaults to the process-wide [`SharedTimer`](crate::SharedTimer)
    pub timer: Option<Arc<dyn EvictionTimer>>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            name: None,
            max_total: Some(8),
            block_when_exhausted: true,
            max_wait: None,
            lifo: true,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: Duration::ZERO,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Duration::from_secs(30 * 60),
            soft_min_evictable_idle_time: None,
            monitoring_enabled: true,
            eviction_policy: None,
            factory_context: None,
            timer: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the maximum number of managed objects
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = Some(max_total);
        self
    }

    pub fn with_unbounded_total(mut self) -> Self {
        self.max_total = None;
        self
    }

    pub fn with_block_when_exhausted(mut self, block: bool) -> Self {
        self.block_when_exhausted = block;
        self
    }

    /// Set the longest time a borrow waits
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Validate on borrow, on return and while idle
    pub fn with_testing(mut self, on_borrow: bool, on_return: bool, while_idle: bool) -> Self {
        self.test_on_borrow = on_borrow;
        self.test_on_return = on_return;
        self.test_while_idle = while_idle;
        self
    }

    /// Run the evictor every `interval`
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_poolcore::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_time_between_eviction_runs(Duration::from_millis(500));
    ///
    /// assert_eq!(config.time_between_eviction_runs, Duration::from_millis(500));
    /// ```
    pub fn with_time_between_eviction_runs(mut self, interval: Duration) -> Self {
        self.time_between_eviction_runs = interval;
        self
    }

    pub fn with_num_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.num_tests_per_eviction_run = tests;
        self
    }

    pub fn with_min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.min_evictable_idle_time = idle;
        self
    }

    pub fn with_soft_min_evictable_idle_time(mut self, idle: Duration) -> Self {
        self.soft_min_evictable_idle_time = Some(idle);
        self
    }

    /// Enable or disable swallowed-error notifications
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring_enabled = enabled;
        self
    }

    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    pub fn with_factory_context(mut self, context: FactoryContext) -> Self {
        self.factory_context = Some(context);
        self
    }

    /// Drive the evictor from `timer` instead of the process-wide timer
    pub fn with_timer(mut self, timer: Arc<dyn EvictionTimer>) -> Self {
        self.timer = Some(timer);
        self
    }
}
