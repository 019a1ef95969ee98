//! One OS thread draining one [`MpscQueue`] of zero-arg tasks in FIFO order.
//!
//! Grounded on `original_source/base/task-runner.{h,cc}`.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::mpsc_queue::MpscQueue;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Identity of the `TaskRunner` whose thread is currently executing, if any.
    /// Used only to back `is_current_thread()`'s invariant check.
    static CURRENT_RUNNER: Cell<usize> = const { Cell::new(0) };
}

struct Inner {
    queue: MpscQueue<Task>,
    running: AtomicBool,
}

/// Owns one OS thread and one task queue. Tasks posted from the same
/// producer run in the order they were posted; tasks from different
/// producers interleave arbitrarily.
pub struct TaskRunner {
    inner: Arc<Inner>,
    join_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(Inner {
            queue: MpscQueue::new(),
            running: AtomicBool::new(true),
        });

        let identity = Arc::as_ptr(&inner) as usize;
        let run_loop_inner = Arc::clone(&inner);
        let join_handle = std::thread::Builder::new()
            .name("task-runner".to_string())
            .spawn(move || {
                CURRENT_RUNNER.with(|c| c.set(identity));
                run_loop(&run_loop_inner);
            })
            .expect("failed to spawn task runner thread");

        Arc::new(TaskRunner {
            inner,
            join_handle: std::sync::Mutex::new(Some(join_handle)),
        })
    }

    /// Posts a task. Safe from any thread, including this runner's own.
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue.push(Box::new(task));
    }

    /// True iff called from this runner's own thread.
    pub fn is_current_thread(&self) -> bool {
        let identity = Arc::as_ptr(&self.inner) as usize;
        CURRENT_RUNNER.with(|c| c.get()) == identity
    }

    /// Stops accepting new work's effect on the run loop, drains what's
    /// already queued, and joins the thread. Idempotent.
    pub fn stop(&self) {
        if self
            .inner
            .running
            .swap(false, Ordering::AcqRel)
        {
            // Post a no-op task purely to break out of wait_not_empty().
            self.inner.queue.push(Box::new(|| {}));
        }
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(inner: &Inner) {
    while inner.running.load(Ordering::Acquire) {
        inner.queue.wait_not_empty();
        while !inner.queue.empty() {
            let task = inner.queue.pop();
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fifo_ordering_from_single_producer() {
        let runner = TaskRunner::new();
        let (tx, rx) = mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            runner.post_task(move || tx.send(i).unwrap());
        }

        for expected in 0..100 {
            assert_eq!(rx.recv().unwrap(), expected);
        }
        runner.stop();
    }

    #[test]
    fn is_current_thread_true_only_inside_runner() {
        let runner = TaskRunner::new();
        assert!(!runner.is_current_thread());

        let runner2 = Arc::clone(&runner);
        let (tx, rx) = mpsc::channel();
        runner.post_task(move || {
            tx.send(runner2.is_current_thread()).unwrap();
        });
        assert!(rx.recv().unwrap());
        runner.stop();
    }

    #[test]
    fn stop_drains_then_joins() {
        let runner = TaskRunner::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            runner.post_task(move || tx.send(i).unwrap());
        }
        runner.stop();
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }
}
