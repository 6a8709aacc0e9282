//! Notifications about errors swallowed by pool maintenance

use crate::errors::{PoolError, PoolResult};
use crate::timer::panic_message;

use dashmap::DashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Kind of the notification sent when a pool swallows an error
pub const SWALLOWED_ERROR_NOTIFICATION: &str = "pool.swallowed.error";

/// An event delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: &'static str,

    /// Name of the emitting pool
    pub source: String,

    /// Monotonic per-pool sequence number, starting at 1
    pub sequence: u64,

    /// Rendered error
    pub message: String,

    pub timestamp: SystemTime,
}

/// Describes the notifications a pool can emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationInfo {
    pub kinds: Vec<&'static str>,
    pub name: &'static str,
    pub description: &'static str,
}

/// Receives notifications synchronously on the emitting thread
pub trait NotificationListener: Send + Sync {
    fn handle_notification(&self, notification: &Notification);
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn handle_notification(&self, notification: &Notification) {
        self(notification)
    }
}

/// Predicate deciding which notifications a listener receives
pub type NotificationFilter = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;

/// Identity of one listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    listener: Arc<dyn NotificationListener>,
    filter: Option<NotificationFilter>,
}

struct Broadcaster {
    source: String,
    listeners: DashMap<ListenerId, Registration>,
    next_id: AtomicU64,
}

/// Fans swallowed-error notifications out to registered listeners.
///
/// A relay built without monitoring drops every notification and rejects
/// every registration call with [`PoolError::MonitoringDisabled`].
///
/// # Examples
///
/// ```
/// use esox_poolcore::{Notification, NotificationRelay, PoolError};
/// use std::sync::Arc;
///
/// let relay = NotificationRelay::disabled();
/// let result = relay.add_listener(Arc::new(|_: &Notification| {}), None);
/// assert_eq!(result.unwrap_err(), PoolError::MonitoringDisabled);
/// ```
pub struct NotificationRelay {
    inner: Option<Broadcaster>,
}

impl NotificationRelay {
    /// Relay delivering notifications tagged with `source`
    pub fn enabled(source: impl Into<String>) -> Self {
        Self {
            inner: Some(Broadcaster {
                source: source.into(),
                listeners: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.listeners.len())
    }

    /// Register `listener`, optionally restricted by `filter`
    pub fn add_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: Option<NotificationFilter>,
    ) -> PoolResult<ListenerId> {
        let inner = self.broadcaster()?;
        let id = ListenerId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        inner.listeners.insert(id, Registration { listener, filter });
        Ok(id)
    }

    /// Remove a single registration
    pub fn remove_listener(&self, id: ListenerId) -> PoolResult<()> {
        let inner = self.broadcaster()?;
        inner
            .listeners
            .remove(&id)
            .map(|_| ())
            .ok_or(PoolError::ListenerNotFound)
    }

    /// Remove every registration of `listener`, returning how many there were
    pub fn remove_listener_instance(
        &self,
        listener: &Arc<dyn NotificationListener>,
    ) -> PoolResult<usize> {
        let inner = self.broadcaster()?;
        let before = inner.listeners.len();
        inner
            .listeners
            .retain(|_, registration| !Arc::ptr_eq(&registration.listener, listener));
        let removed = before.saturating_sub(inner.listeners.len());

        if removed == 0 {
            return Err(PoolError::ListenerNotFound);
        }
        Ok(removed)
    }

    pub fn notification_info(&self) -> PoolResult<Vec<NotificationInfo>> {
        self.broadcaster()?;
        Ok(vec![NotificationInfo {
            kinds: vec![SWALLOWED_ERROR_NOTIFICATION],
            name: "Notification",
            description: "An error was swallowed by pool maintenance",
        }])
    }

    /// Deliver a swallowed-error notification; a no-op when disabled
    pub fn emit_swallowed(&self, sequence: u64, message: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        let notification = Notification {
            kind: SWALLOWED_ERROR_NOTIFICATION,
            source: inner.source.clone(),
            sequence,
            message: message.to_string(),
            timestamp: SystemTime::now(),
        };

        // Listeners may register or remove listeners while being notified.
        let registrations: Vec<_> = inner
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, registration) in registrations {
            if let Some(filter) = &registration.filter
                && !filter(&notification)
            {
                continue;
            }

            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                registration.listener.handle_notification(&notification)
            }));
            if let Err(payload) = delivered {
                warn!(
                    listener = %id,
                    panic_message = %panic_message(payload.as_ref()),
                    "notification listener panicked"
                );
            }
        }
    }

    fn broadcaster(&self) -> PoolResult<&Broadcaster> {
        self.inner.as_ref().ok_or(PoolError::MonitoringDisabled)
    }
}
