//! # esox_poolcore
//!
//! Shared maintenance and telemetry core for object pools: a periodic evictor
//! multiplexed over one process-wide timer, plus the statistics every pool
//! keeps about its borrows, returns and swallowed errors.
//!
//! ## Features
//!
//! - One evictor task per pool, swapped atomically when the interval changes
//! - Shared timer thread, or a tokio runtime, driving every pool's evictor
//! - Failure isolation: a failing or panicking maintenance run never stops
//!   later runs
//! - Factory context installed around every maintenance run
//! - Rolling means of active, idle and wait times over the last 100 samples
//! - Lock-free lifetime counters and max wait tracking
//! - Bounded journal of swallowed errors
//! - Swallowed-error notifications for registered listeners
//! - Prometheus metrics export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_poolcore::{Maintenance, PoolConfiguration, PoolCore, PoolResult};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct MyPool {
//!     core: PoolCore,
//! }
//!
//! impl Maintenance for MyPool {
//!     fn evict(&self) -> PoolResult<()> {
//!         Ok(())
//!     }
//!
//!     fn ensure_min_idle(&self) -> PoolResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let pool = Arc::new(MyPool {
//!     core: PoolCore::new(PoolConfiguration::default()),
//! });
//! pool.core.attach(&pool);
//!
//! // Start running maintenance every 30 seconds
//! pool.core.set_time_between_eviction_runs(Duration::from_secs(30));
//! assert!(pool.core.is_evictor_scheduled());
//!
//! pool.core.close();
//! ```

mod config;
mod context;
mod errors;
mod eviction;
mod evictor;
mod journal;
mod metrics;
mod notification;
mod pool;
mod rolling;
mod timer;
mod tokio_timer;

pub use config::PoolConfiguration;
pub use context::{ContextScope, FactoryContext};
pub use errors::{PoolError, PoolResult};
pub use eviction::{EvictionConfig, EvictionPolicy};
pub use evictor::Maintenance;
pub use journal::{render_error, SwallowedErrors, SWALLOWED_ERROR_QUEUE_SIZE};
pub use metrics::{DestroyCause, MetricsExporter, PoolMetrics, PoolStats};
pub use notification::{
    ListenerId, Notification, NotificationFilter, NotificationInfo, NotificationListener,
    NotificationRelay, SWALLOWED_ERROR_NOTIFICATION,
};
pub use pool::PoolCore;
pub use rolling::{RollingWindow, MEAN_TIMING_STATS_CACHE_SIZE};
pub use timer::{EvictionTimer, SharedTimer, TimerHandle, TimerTask};
pub use tokio_timer::TokioTimer;
