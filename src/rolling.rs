//! Fixed-capacity rolling sample windows

use num_traits::ToPrimitive;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Number of samples kept by each timing window of a pool
pub const MEAN_TIMING_STATS_CACHE_SIZE: usize = 100;

/// A fixed-size FIFO of optional samples.
///
/// The window is pre-filled with empty slots, so it always holds exactly
/// `capacity` entries and every insert evicts the oldest one.
///
/// # Examples
///
/// ```
/// use esox_poolcore::RollingWindow;
///
/// let window = RollingWindow::new(3);
/// assert_eq!(window.mean(), 0.0);
///
/// window.record(10_u64);
/// window.record(20_u64);
/// assert_eq!(window.mean(), 15.0);
/// assert_eq!(window.snapshot(), vec![None, Some(10), Some(20)]);
/// ```
pub struct RollingWindow<T> {
    slots: Mutex<VecDeque<Option<T>>>,
    capacity: usize,
}

impl<T: Clone> RollingWindow<T> {
    /// Create a window of `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        let mut slots = VecDeque::with_capacity(capacity + 1);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
            capacity,
        }
    }

    /// Number of slots in the window
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest slot
    pub fn record(&self, value: T) {
        let mut slots = self.slots.lock();
        slots.push_back(Some(value));
        slots.pop_front();
    }

    /// Copy of the slots, oldest first
    pub fn snapshot(&self) -> Vec<Option<T>> {
        self.slots.lock().iter().cloned().collect()
    }
}

impl<T: Clone + ToPrimitive> RollingWindow<T> {
    /// Running mean of the present samples, or 0 if there are none
    pub fn mean(&self) -> f64 {
        let samples = self.snapshot();

        let mut mean = 0.0;
        let mut counter = 0_u32;
        for sample in samples.iter().flatten() {
            let Some(value) = sample.to_f64() else {
                continue;
            };
            counter += 1;
            let k = f64::from(counter);
            mean = mean * ((k - 1.0) / k) + value / k;
        }
        mean
    }
}

impl<T: Clone> Default for RollingWindow<T> {
    fn default() -> Self {
        Self::new(MEAN_TIMING_STATS_CACHE_SIZE)
    }
}
