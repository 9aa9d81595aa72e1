//! Single-slot blocking handoff.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: T,
    is_set: bool,
}

/// A value one thread sets and another waits for, with a bounded wait.
///
/// Reading does not consume the value: once set, every `get_value` returns
/// the last stored value until `clear` is called.
pub struct BlockData<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    interval: Duration,
}

impl<T: Clone> BlockData<T> {
    /// Creates an unset slot that waits up to `interval` and reports
    /// `invalid` on timeout.
    pub fn new(interval: Duration, invalid: T) -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: invalid,
                is_set: false,
            }),
            ready: Condvar::new(),
            interval,
        }
    }

    /// Stores `value` and wakes a waiter.
    pub fn set_value(&self, value: T) {
        let mut slot = self.slot.lock();
        slot.value = value;
        slot.is_set = true;
        drop(slot);
        self.ready.notify_one();
    }

    /// Waits for a value. Returns the invalid value on timeout.
    pub fn get_value(&self) -> T {
        let deadline = Instant::now() + self.interval;
        let mut slot = self.slot.lock();
        while !slot.is_set {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.value.clone()
    }

    /// Returns true once a value was stored.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_set
    }

    /// Resets to unset with a new invalid value.
    pub fn clear(&self, invalid: T) {
        let mut slot = self.slot.lock();
        slot.value = invalid;
        slot.is_set = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn value_set_from_another_thread() {
        let data = Arc::new(BlockData::new(Duration::from_secs(2), -1));
        let writer = Arc::clone(&data);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            writer.set_value(7);
        });
        assert_eq!(data.get_value(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn timeout_returns_invalid() {
        let data = BlockData::new(Duration::from_millis(20), "invalid");
        let started = Instant::now();
        assert_eq!(data.get_value(), "invalid");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reading_does_not_clear() {
        let data = BlockData::new(Duration::from_millis(10), 0);
        data.set_value(3);
        assert_eq!(data.get_value(), 3);
        assert_eq!(data.get_value(), 3);
        data.clear(-5);
        assert!(!data.is_set());
        assert_eq!(data.get_value(), -5);
    }
}
