//! Fixed-size pool of [`TaskRunner`]s with atomic round-robin dispatch.
//!
//! Grounded on `original_source/main/thread-pool.{h,cc}`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::task_runner::TaskRunner;

const DEFAULT_WORKER_COUNT: usize = 16;

pub struct ThreadPool {
    runners: Vec<Arc<TaskRunner>>,
    next: AtomicU64,
}

impl ThreadPool {
    /// `size == 0` picks `DEFAULT_WORKER_COUNT`.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_WORKER_COUNT } else { size };
        let runners = (0..size).map(|_| TaskRunner::new()).collect();
        ThreadPool {
            runners,
            next: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Picks the next runner in round-robin order. The choice should be made
    /// once per connection and then stuck with for that connection's life.
    pub fn next_runner(&self) -> Arc<TaskRunner> {
        let idx = self.next.fetch_add(1, Ordering::AcqRel) as usize % self.runners.len();
        Arc::clone(&self.runners[idx])
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for runner in &self.runners {
            runner.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_defaults_to_sixteen() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.len(), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn round_robin_cycles_through_all_runners() {
        let pool = ThreadPool::new(4);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let runner = pool.next_runner();
            seen.push(Arc::as_ptr(&runner) as usize);
        }
        assert_eq!(&seen[0..4], &seen[4..8]);
        let mut unique = seen[0..4].to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);
    }
}
