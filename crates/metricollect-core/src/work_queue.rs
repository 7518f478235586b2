//! Shared FIFO of metric identifiers.
//!
//! One producer (the control loop) and many consumers (worker dispatch
//! threads). Every pop is atomic under the lock, so an item is delivered to
//! exactly one consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Thread-safe FIFO work queue.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<String>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: impl Into<String>) {
        self.items.lock().push_back(item.into());
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<String> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items.lock().iter().any(|queued| queued == item)
    }

    /// Copy of the queued items, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.items.lock().iter().cloned().collect()
    }

    /// Drop every queued item and return how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let removed = items.len();
        items.clear();
        removed
    }
}
