//! Telemetry collection and export for pools

use crate::rolling::RollingWindow;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why a pooled object was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyCause {
    /// Destroyed by the pool during normal operation
    Normal,

    /// Destroyed by the evictor
    Evictor,

    /// Destroyed because it failed validation while being borrowed
    BorrowValidation,
}

/// Point-in-time view of a pool's telemetry
///
/// # Examples
///
/// ```
/// use esox_poolcore::PoolStats;
/// use std::time::Duration;
///
/// let stats = PoolStats::new();
/// stats.on_borrow(Duration::from_millis(50), Duration::from_millis(10));
///
/// let metrics = stats.snapshot();
/// assert_eq!(metrics.borrowed_count, 1);
/// assert_eq!(metrics.max_borrow_wait_time_millis, 10);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Objects created over the pool's lifetime
    pub created_count: u64,

    /// Objects destroyed over the pool's lifetime, for any cause
    pub destroyed_count: u64,

    /// Objects destroyed by the evictor
    pub destroyed_by_evictor_count: u64,

    /// Objects destroyed after failing validation on borrow
    pub destroyed_by_borrow_validation_count: u64,

    /// Successful borrows
    pub borrowed_count: u64,

    /// Returns
    pub returned_count: u64,

    /// Errors swallowed by pool maintenance
    pub swallowed_error_count: u64,

    /// Mean time objects stayed borrowed, over the last returns
    pub mean_active_time_millis: u64,

    /// Mean time objects sat idle, over the last borrows
    pub mean_idle_time_millis: u64,

    /// Mean time borrowers waited, over the last borrows
    pub mean_borrow_wait_time_millis: u64,

    /// Longest time any borrower has waited
    pub max_borrow_wait_time_millis: u64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("created_count".to_string(), self.created_count.to_string());
        metrics.insert("destroyed_count".to_string(), self.destroyed_count.to_string());
        metrics.insert(
            "destroyed_by_evictor_count".to_string(),
            self.destroyed_by_evictor_count.to_string(),
        );
        metrics.insert(
            "destroyed_by_borrow_validation_count".to_string(),
            self.destroyed_by_borrow_validation_count.to_string(),
        );
        metrics.insert("borrowed_count".to_string(), self.borrowed_count.to_string());
        metrics.insert("returned_count".to_string(), self.returned_count.to_string());
        metrics.insert(
            "swallowed_error_count".to_string(),
            self.swallowed_error_count.to_string(),
        );
        metrics.insert(
            "mean_active_time_millis".to_string(),
            self.mean_active_time_millis.to_string(),
        );
        metrics.insert(
            "mean_idle_time_millis".to_string(),
            self.mean_idle_time_millis.to_string(),
        );
        metrics.insert(
            "mean_borrow_wait_time_millis".to_string(),
            self.mean_borrow_wait_time_millis.to_string(),
        );
        metrics.insert(
            "max_borrow_wait_time_millis".to_string(),
            self.max_borrow_wait_time_millis.to_string(),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_poolcore::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let stats = PoolStats::new();
    /// stats.on_create();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stats.snapshot(), "my_pool", Some(&tags));
    /// assert!(output.contains("pool_objects_created_total"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Counter metrics
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_created_total",
            "counter",
            "Total objects created",
            metrics.created_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_destroyed_total",
            "counter",
            "Total objects destroyed",
            metrics.destroyed_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_destroyed_by_evictor_total",
            "counter",
            "Objects destroyed by the evictor",
            metrics.destroyed_by_evictor_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_destroyed_by_borrow_validation_total",
            "counter",
            "Objects destroyed after failing borrow validation",
            metrics.destroyed_by_borrow_validation_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_borrowed_total",
            "counter",
            "Total objects borrowed",
            metrics.borrowed_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_objects_returned_total",
            "counter",
            "Total objects returned",
            metrics.returned_count,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_swallowed_errors_total",
            "counter",
            "Errors swallowed by pool maintenance",
            metrics.swallowed_error_count,
        );

        // Gauge metrics
        Self::push_metric(
            &mut output,
            &labels,
            "pool_active_time_mean_millis",
            "gauge",
            "Mean time objects stay borrowed",
            metrics.mean_active_time_millis,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_idle_time_mean_millis",
            "gauge",
            "Mean time objects stay idle",
            metrics.mean_idle_time_millis,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_borrow_wait_mean_millis",
            "gauge",
            "Mean time borrowers wait",
            metrics.mean_borrow_wait_time_millis,
        );
        Self::push_metric(
            &mut output,
            &labels,
            "pool_borrow_wait_max_millis",
            "gauge",
            "Longest time a borrower has waited",
            metrics.max_borrow_wait_time_millis,
        );

        output
    }

    fn push_metric(
        output: &mut String,
        labels: &str,
        name: &str,
        kind: &str,
        help: &str,
        value: u64,
    ) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Lifetime counters and timing windows of a pool.
///
/// Counters are independent atomics, so a reader may see more borrows than
/// returns at any moment. Each window and the max-wait value have their own
/// lock.
pub struct PoolStats {
    created: CachePadded<AtomicU64>,
    destroyed: CachePadded<AtomicU64>,
    destroyed_by_evictor: CachePadded<AtomicU64>,
    destroyed_by_borrow_validation: CachePadded<AtomicU64>,
    borrowed: CachePadded<AtomicU64>,
    returned: CachePadded<AtomicU64>,
    swallowed: CachePadded<AtomicU64>,
    active_times: RollingWindow<u64>,
    idle_times: RollingWindow<u64>,
    wait_times: RollingWindow<u64>,
    max_borrow_wait: Mutex<u64>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self {
            created: CachePadded::new(AtomicU64::new(0)),
            destroyed: CachePadded::new(AtomicU64::new(0)),
            destroyed_by_evictor: CachePadded::new(AtomicU64::new(0)),
            destroyed_by_borrow_validation: CachePadded::new(AtomicU64::new(0)),
            borrowed: CachePadded::new(AtomicU64::new(0)),
            returned: CachePadded::new(AtomicU64::new(0)),
            swallowed: CachePadded::new(AtomicU64::new(0)),
            active_times: RollingWindow::default(),
            idle_times: RollingWindow::default(),
            wait_times: RollingWindow::default(),
            max_borrow_wait: Mutex::new(0),
        }
    }

    /// Record a successful borrow
    pub fn on_borrow(&self, idle: Duration, wait: Duration) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.idle_times.record(millis(idle));

        let wait = millis(wait);
        self.wait_times.record(wait);

        let mut max = self.max_borrow_wait.lock();
        if wait > *max {
            *max = wait;
        }
    }

    /// Record an object coming back to the pool
    pub fn on_return(&self, active: Duration) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.active_times.record(millis(active));
    }

    pub fn on_create(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a destroyed object; the total always moves, plus the counter for `cause`
    pub fn on_destroy(&self, cause: DestroyCause) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        match cause {
            DestroyCause::Normal => {}
            DestroyCause::Evictor => {
                self.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
            }
            DestroyCause::BorrowValidation => {
                self.destroyed_by_borrow_validation.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count a swallowed error, returning its sequence number (starting at 1)
    pub fn on_swallowed(&self) -> u64 {
        self.swallowed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn destroyed_by_evictor_count(&self) -> u64 {
        self.destroyed_by_evictor.load(Ordering::Relaxed)
    }

    pub fn destroyed_by_borrow_validation_count(&self) -> u64 {
        self.destroyed_by_borrow_validation.load(Ordering::Relaxed)
    }

    pub fn borrowed_count(&self) -> u64 {
        self.borrowed.load(Ordering::Relaxed)
    }

    pub fn returned_count(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn swallowed_count(&self) -> u64 {
        self.swallowed.load(Ordering::Relaxed)
    }

    /// Rolling means are rounded to the nearest millisecond rather than
    /// truncated, so samples of 10, 30 and 5 ms report 15 and not 14.
    pub fn mean_active_time_millis(&self) -> u64 {
        self.active_times.mean().round() as u64
    }

    pub fn mean_idle_time_millis(&self) -> u64 {
        self.idle_times.mean().round() as u64
    }

    pub fn mean_borrow_wait_time_millis(&self) -> u64 {
        self.wait_times.mean().round() as u64
    }

    pub fn max_borrow_wait_time_millis(&self) -> u64 {
        *self.max_borrow_wait.lock()
    }

    /// Read every counter and mean once
    pub fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            created_count: self.created_count(),
            destroyed_count: self.destroyed_count(),
            destroyed_by_evictor_count: self.destroyed_by_evictor_count(),
            destroyed_by_borrow_validation_count: self.destroyed_by_borrow_validation_count(),
            borrowed_count: self.borrowed_count(),
            returned_count: self.returned_count(),
            swallowed_error_count: self.swallowed_count(),
            mean_active_time_millis: self.mean_active_time_millis(),
            mean_idle_time_millis: self.mean_idle_time_millis(),
            mean_borrow_wait_time_millis: self.mean_borrow_wait_time_millis(),
            max_borrow_wait_time_millis: self.max_borrow_wait_time_millis(),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
