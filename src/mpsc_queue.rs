//! Unbounded multi-producer single-consumer queue.
//!
//! Grounded on `original_source/base/mpsc-queue.h`: a sentinel (dummy) head
//! node so producers never touch `head`, and a short mutex only around the
//! tail pointer. The consumer side (`empty`/`pop`) touches only `head` and
//! needs no locking at all.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Condvar, Mutex};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }))
    }

    fn with_value(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        }))
    }
}

/// Multi-producer, single-consumer unbounded FIFO queue.
///
/// `push` may be called from any thread. `empty`/`pop`/`wait_not_empty` must
/// only be called from the single designated consumer thread.
pub struct MpscQueue<T> {
    head: std::cell::UnsafeCell<*mut Node<T>>,
    tail: Mutex<*mut Node<T>>,
    has_data: Mutex<bool>,
    condvar: Condvar,
}

// SAFETY: `head` is only ever touched from the consumer thread (enforced by
// the API contract, not the type system — mirroring the original's
// single-consumer discipline). `tail` is guarded by `tail`'s own mutex.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        MpscQueue {
            head: std::cell::UnsafeCell::new(sentinel),
            tail: Mutex::new(sentinel),
            has_data: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Enqueues `val`. Safe to call concurrently from any number of threads.
    pub fn push(&self, val: T) {
        let node = Node::with_value(val);
        {
            let mut tail = self.tail.lock().unwrap();
            // SAFETY: `*tail` is only ever reachable through this lock once
            // installed, and stays alive until replaced here.
            unsafe {
                (**tail).next.store(node, Ordering::Release);
            }
            *tail = node;
        }
        let mut has_data = self.has_data.lock().unwrap();
        *has_data = true;
        self.condvar.notify_one();
    }

    /// True iff there is no element beyond the sentinel head node.
    ///
    /// Consumer-only.
    pub fn empty(&self) -> bool {
        unsafe {
            let head = *self.head.get();
            (*head).next.load(Ordering::Acquire).is_null()
        }
    }

    /// Removes and returns the oldest element.
    ///
    /// Consumer-only. Panics if `empty()`.
    pub fn pop(&self) -> T {
        unsafe {
            let dummy = *self.head.get();
            let next = (*dummy).next.load(Ordering::Acquire);
            assert!(!next.is_null(), "pop() called on an empty MpscQueue");
            let value = (*next).value.take().expect("node has a value");
            *self.head.get() = next;
            drop(Box::from_raw(dummy));
            value
        }
    }

    /// Blocks until `empty()` is false, then returns `false` (not empty).
    /// May also return spuriously after a wake with `empty()` true.
    ///
    /// Consumer-only.
    pub fn wait_not_empty(&self) -> bool {
        if !self.empty() {
            return false;
        }
        let mut has_data = self.has_data.lock().unwrap();
        while !*has_data && self.empty() {
            has_data = self.condvar.wait(has_data).unwrap();
        }
        *has_data = false;
        self.empty()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut cur = *self.head.get();
            while !cur.is_null() {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_fifo() {
        let q = MpscQueue::new();
        assert!(q.empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(!q.empty());
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
        assert!(q.empty());
    }

    #[test]
    fn concurrent_producers_preserve_per_producer_order() {
        let q = Arc::new(MpscQueue::new());
        let producers = 8;
        let per_producer = 200;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        q.push((p, i));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut last_seen = vec![-1i32; producers];
        let mut total = 0;
        while !q.empty() {
            let (p, i) = q.pop();
            assert!(i as i32 > last_seen[p]);
            last_seen[p] = i as i32;
            total += 1;
        }
        assert_eq!(total, producers * per_producer);
    }

    #[test]
    fn wait_not_empty_wakes_on_push() {
        let q = Arc::new(MpscQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            q2.push(42);
        });

        let empty_after_wait = q.wait_not_empty();
        assert!(!empty_after_wait);
        assert_eq!(q.pop(), 42);
        handle.join().unwrap();
    }
}
