//! Eviction policy seam for concrete pools
//!
//! The pool core never decides which idle objects go. Concrete pools ask the
//! configured [`EvictionPolicy`] while they walk their idle objects in
//! [`Maintenance::evict`](crate::Maintenance::evict).

use std::fmt;
use std::time::Duration;

/// Idle thresholds handed to an eviction policy
///
/// # Examples
///
/// ```
/// use esox_poolcore::EvictionConfig;
/// use std::time::Duration;
///
/// let config = EvictionConfig::new(Duration::from_secs(60), Some(Duration::from_secs(10)), 2);
/// assert_eq!(config.min_idle, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Objects idle for longer than this may be evicted
    pub idle_evict_time: Duration,

    /// Objects idle for longer than this may be evicted while more than
    /// `min_idle` objects remain idle
    pub idle_soft_evict_time: Option<Duration>,

    /// Idle objects the pool wants to keep
    pub min_idle: usize,
}

impl EvictionConfig {
    pub fn new(
        idle_evict_time: Duration,
        idle_soft_evict_time: Option<Duration>,
        min_idle: usize,
    ) -> Self {
        Self {
            idle_evict_time,
            idle_soft_evict_time,
            min_idle,
        }
    }
}

/// Decides whether an idle object should be evicted.
///
/// # Examples
///
/// ```
/// use esox_poolcore::{EvictionConfig, EvictionPolicy};
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct HardLimit;
///
/// impl EvictionPolicy for HardLimit {
///     fn evict(&self, config: &EvictionConfig, idle_time: Duration, _idle_count: usize) -> bool {
///         idle_time > config.idle_evict_time
///     }
/// }
///
/// let config = EvictionConfig::new(Duration::from_secs(5), None, 0);
/// assert!(HardLimit.evict(&config, Duration::from_secs(6), 1));
/// ```
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// `idle_count` is the number of idle objects, including the one under test
    fn evict(&self, config: &EvictionConfig, idle_time: Duration, idle_count: usize) -> bool;
}
