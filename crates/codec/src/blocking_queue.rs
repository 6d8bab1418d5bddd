//! Bounded FIFO handoff queue with an overflow callback.
//!
//! Mirrors `BlockingQueue`: `put` enqueues and, if the queue is over
//! capacity, hands the eldest element to the overflow callback and drops
//! it rather than growing unbounded. A queue with no overflow callback
//! that overflows is an internal invariant violation and panics, matching
//! the original's `abort()`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct BlockingQueue<T> {
    capacity: usize,
    state: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    overflow: Option<Box<dyn Fn(T) + Send + Sync>>,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            overflow: None,
        }
    }

    pub fn with_overflow_callback(capacity: usize, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            capacity,
            state: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            overflow: Some(Box::new(callback)),
        }
    }

    /// Enqueues `item`. If the queue is now over capacity, the eldest item
    /// is handed to the overflow callback and dropped.
    ///
    /// # Panics
    /// Panics if the queue overflows and no overflow callback was set.
    pub fn put(&self, item: T) {
        let mut queue = self.state.lock().unwrap();
        queue.push_back(item);
        let mut overflowed = false;
        while queue.len() > self.capacity {
            overflowed = true;
            let eldest = queue.pop_front().unwrap();
            match &self.overflow {
                Some(cb) => cb(eldest),
                None => panic!("blocking queue overflowed with no overflow callback set"),
            }
        }
        if !overflowed {
            self.not_empty.notify_one();
        }
    }

    /// Blocks until an item is available, then returns it.
    pub fn get_blocking(&self) -> T {
        let mut queue = self.state.lock().unwrap();
        while queue.is_empty() {
            queue = self.not_empty.wait(queue).unwrap();
        }
        queue.pop_front().unwrap()
    }

    /// Returns an item immediately if one is available, `None` otherwise.
    pub fn get(&self) -> Option<T> {
        self.state.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
