//! Thread-safe FIFO used to hand work into the session thread and results
//! back out.
//!
//! Backed by a mutex and a condition variable. The bounded-timeout variants
//! double as the session's scheduling tick: the multiplexer polls the queue
//! length with a short budget instead of busy-waiting.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Entry<T> {
    item: T,
    enqueued: Instant,
}

pub struct Queue<T> {
    inner: Mutex<VecDeque<Entry<T>>>,
    wakeup: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        inner.push_back(Entry {
            item,
            enqueued: Instant::now(),
        });
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Removes the oldest item, blocking until one is available.
    pub fn pop(&self) -> T {
        let mut inner = self.lock();
        loop {
            if let Some(entry) = inner.pop_front() {
                return entry.item;
            }
            inner = self
                .wakeup
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes the oldest item, waiting at most `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(entry) = inner.pop_front() {
                return Some(entry.item);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self
                .wakeup
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
            if result.timed_out() && inner.is_empty() {
                return None;
            }
        }
    }

    /// Current length, waiting at most `timeout` for the queue to become
    /// non-empty first.
    pub fn len_within(&self, timeout: Duration) -> usize {
        let inner = self.lock();
        if inner.is_empty() {
            let (guard, _) = self
                .wakeup
                .wait_timeout(inner, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            return guard.len();
        }
        inner.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops entries older than `max_age` and returns how many were removed.
    pub fn expire(&self, max_age: Duration) -> usize {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|entry| entry.enqueued.elapsed() <= max_age);
        let dropped = before - inner.len();
        if dropped > 0 {
            warn!("dropped {dropped} expired queue entries");
        }
        dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry<T>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn pops_in_fifo_order() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue: Queue<u32> = Queue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn push_wakes_a_blocked_consumer() {
        let queue = Arc::new(Queue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn len_within_sees_concurrent_push() {
        let queue = Arc::new(Queue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push("late");
            })
        };
        assert_eq!(queue.len_within(Duration::from_secs(5)), 1);
        producer.join().unwrap();
    }

    #[test]
    fn expire_drops_old_entries() {
        let queue = Queue::new();
        queue.push("stale");
        thread::sleep(Duration::from_millis(30));
        queue.push("fresh");
        assert_eq!(queue.expire(Duration::from_millis(20)), 1);
        assert_eq!(queue.pop(), "fresh");
    }
}
