//! Bounded history of errors swallowed by pool maintenance

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::Write;

/// Number of swallowed errors retained by a pool
pub const SWALLOWED_ERROR_QUEUE_SIZE: usize = 10;

/// Render an error and its cause chain to a self-contained string.
///
/// Only text is kept, so nothing referenced by the error outlives the call.
pub fn render_error(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(rendered, "\ncaused by: {cause}");
        source = cause.source();
    }
    rendered
}

/// Fixed-size FIFO of rendered errors, oldest first.
///
/// # Examples
///
/// ```
/// use esox_poolcore::{PoolError, SwallowedErrors};
///
/// let journal = SwallowedErrors::new();
/// journal.record(&PoolError::ValidationFailed);
///
/// let entries = journal.snapshot();
/// assert_eq!(entries.len(), 10);
/// assert_eq!(entries[9].as_deref(), Some("Object validation failed"));
/// ```
pub struct SwallowedErrors {
    entries: Mutex<VecDeque<Option<String>>>,
}

impl SwallowedErrors {
    pub fn new() -> Self {
        let mut entries = VecDeque::with_capacity(SWALLOWED_ERROR_QUEUE_SIZE + 1);
        entries.resize_with(SWALLOWED_ERROR_QUEUE_SIZE, || None);
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Render `error` and append it, dropping the oldest entry
    pub fn record(&self, error: &(dyn Error + 'static)) {
        self.record_message(render_error(error));
    }

    /// Append an already rendered entry, dropping the oldest entry
    pub fn record_message(&self, message: String) {
        let mut entries = self.entries.lock();
        entries.push_back(Some(message));
        entries.pop_front();
    }

    /// All slots, oldest first; slots never written are `None`
    pub fn snapshot(&self) -> Vec<Option<String>> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Only the recorded entries, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().flatten().cloned().collect()
    }
}

impl Default for SwallowedErrors {
    fn default() -> Self {
        Self::new()
    }
}
