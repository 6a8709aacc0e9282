//! Per-thread ambient context of a pool's resource factory
//!
//! A pool remembers the context that was current when it was built. The
//! evictor installs that context on the timer thread for the duration of each
//! maintenance run, so factory code sees the same ambient value it would see on
//! the pool's own call sites.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<FactoryContext>> = const { RefCell::new(None) };
}

/// Opaque, cheaply cloneable ambient value
///
/// # Examples
///
/// ```
/// use esox_poolcore::FactoryContext;
///
/// let context = FactoryContext::new("tenant-a");
/// {
///     let _scope = FactoryContext::enter(Some(context.clone()));
///     let current = FactoryContext::current().unwrap();
///     assert_eq!(current.downcast_ref::<&str>(), Some(&"tenant-a"));
/// }
/// assert!(FactoryContext::current().is_none());
/// ```
#[derive(Clone)]
pub struct FactoryContext {
    value: Arc<dyn Any + Send + Sync>,
}

impl FactoryContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Whether both handles refer to the same context value
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    /// Context installed on the calling thread
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Install `context` on the calling thread, returning the previous one
    pub fn replace(context: Option<Self>) -> Option<Self> {
        CURRENT.with(|current| current.replace(context))
    }

    /// Install `context` until the returned scope is dropped
    pub fn enter(context: Option<Self>) -> ContextScope {
        ContextScope {
            previous: Some(Self::replace(context)),
        }
    }
}

impl fmt::Debug for FactoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryContext")
            .field("value", &Arc::as_ptr(&self.value))
            .finish()
    }
}

/// Restores the previously installed context when dropped
#[must_use = "the context is restored as soon as the scope is dropped"]
pub struct ContextScope {
    previous: Option<Option<FactoryContext>>,
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope").finish_non_exhaustive()
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            FactoryContext::replace(previous);
        }
    }
}
