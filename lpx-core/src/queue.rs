//! Bounded pop-oldest queues between the pipeline stages.
//!
//! Each queue is a mutex-guarded FIFO plus a condition variable.
//! Pushing onto a full queue drops the oldest entry, so sustained
//! producer excess keeps the pipeline lossy but bounded-memory and
//! low-latency. Closing the queue wakes every blocked consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    open: bool,
}

/// A bounded FIFO with pop-oldest overflow and cooperative shutdown.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                open: true,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Push an item, dropping the oldest entry if the queue is full.
    /// Never blocks. Returns the number of entries dropped.
    pub fn push(&self, item: T) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.open {
            return 0;
        }
        let mut dropped = 0;
        while state.items.len() >= self.capacity {
            state.items.pop_front();
            dropped += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        dropped
    }

    /// Pop the oldest item, blocking until one arrives or the queue
    /// is closed. `None` means closed-and-drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if !state.open {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }

    /// Close the queue and wake all blocked consumers. Items already
    /// queued remain poppable; further pushes are discarded.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open = false;
        drop(state);
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(3);
        q.push(1);
        q.push(2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn overflow_drops_oldest_without_blocking() {
        let q = BoundedQueue::new(3);
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), Some(8));
        assert_eq!(q.pop(), Some(9));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q = Arc::new(BoundedQueue::<u32>::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn close_drains_remaining_items() {
        let q = BoundedQueue::new(3);
        q.push("a");
        q.close();
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), None);
        q.push("b");
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn blocked_pop_receives_later_push() {
        let q = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        q.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }
}
