//! `BoundedQueue<T>` — a capacity-bounded blocking FIFO of owned items
//! (spec.md §4.A). Ported from the original `BlockingQueue<T>`
//! (`std::mutex` + `std::condition_variable`, `cv_.wait` predicate loops).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Capacity-bounded blocking queue. `Push` blocks while the queue is full;
/// `Pop` blocks while it is empty. Elements move by ownership.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    /// Panics if `capacity` is 0 — the spec requires `C > 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be greater than 0");
        BoundedQueue {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks until `size() < capacity()`, then enqueues `v` and wakes one
    /// waiting `pop`.
    pub fn push(&self, v: T) {
        let mut guard = self.inner.lock().unwrap();
        guard = self
            .not_full
            .wait_while(guard, |q| q.len() >= self.capacity)
            .unwrap();
        guard.push_back(v);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Blocks until the queue is non-empty, then dequeues the front element
    /// and wakes one waiting `push`.
    pub fn pop(&self) -> T {
        let mut guard = self.inner.lock().unwrap();
        guard = self.not_empty.wait_while(guard, |q| q.is_empty()).unwrap();
        let v = guard.pop_front().expect("queue non-empty by wait_while predicate");
        drop(guard);
        self.not_full.notify_one();
        v
    }

    /// Non-blocking pop used by the Async/Geo `BatchesCounter` polling loop.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let v = guard.pop_front();
        if v.is_some() {
            drop(guard);
            self.not_full.notify_one();
        }
        v
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        let _q: BoundedQueue<i32> = BoundedQueue::new(0);
    }

    #[test]
    fn push_pop_is_fifo() {
        let q = BoundedQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1);
        q.push(2);
        assert_eq!(q.size(), 2);
        assert_eq!(q.cap(), 2);

        let q2 = q.clone();
        let pusher = thread::spawn(move || q2.push(3));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.size(), 2, "push must block while full");

        assert_eq!(q.pop(), 1);
        pusher.join().unwrap();
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn pop_blocks_until_pushed() {
        let q = Arc::new(BoundedQueue::new(1));
        let q2 = q.clone();
        let popper = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.push(42);
        assert_eq!(popper.join().unwrap(), 42);
    }

    #[test]
    fn try_pop_does_not_block_when_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        assert_eq!(q.try_pop(), None);
        q.push(5);
        assert_eq!(q.try_pop(), Some(5));
    }

    use proptest::prelude::*;

    proptest! {
        // Invariant 1 (spec.md §8): for any capacity and any sequence of
        // values pushed then drained on a single thread, size() never
        // exceeds cap() and pop() returns them in the order they were
        // pushed.
        #[test]
        fn size_bounded_and_pops_are_fifo(
            cap in 1usize..32,
            values in prop::collection::vec(any::<i32>(), 0..64),
        ) {
            let q: BoundedQueue<i32> = BoundedQueue::new(cap);
            for window in values.chunks(cap.max(1)) {
                for v in window {
                    q.push(*v);
                    prop_assert!(q.size() <= q.cap());
                }
                for v in window {
                    prop_assert_eq!(q.pop(), *v);
                }
            }
        }
    }
}
