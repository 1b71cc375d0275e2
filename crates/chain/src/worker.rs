//! Bounded worker pool for side-effect-free work.
//!
//! The controller's main thread owns every state mutation; the pool only
//! runs pure tasks — signature recovery, merkle computation, block
//! serialization — whose results come back over one-shot channels awaited
//! at the integration points inside `finalize_block` and `apply_block`.

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::mpsc;

/// Handle to a task submitted to the pool.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task's result is available.
    ///
    /// Panics if the worker itself panicked; a panic in pure computation is
    /// a programming error equivalent to an allocation failure and must not
    /// be swallowed.
    pub fn wait(self) -> T {
        match self.rx.recv() {
            Ok(value) => value,
            Err(_) => panic!("worker task panicked or pool shut down"),
        }
    }
}

/// The worker pool.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Build a pool with `threads` workers (minimum one).
    pub fn new(threads: usize) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("veldt-worker-{i}"))
            .build()
            .expect("worker pool construction only fails on invalid configuration");
        WorkerPool { pool }
    }

    /// Submit a side-effect-free task. Results are delivered through the
    /// returned handle; submission order is preserved per receiver by
    /// construction (one channel per task).
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pool.spawn(move || {
            // A dropped receiver just means the caller abandoned the result.
            let _ = tx.send(task());
        });
        TaskHandle { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_come_back_to_the_submitting_thread() {
        let pool = WorkerPool::new(2);
        let handles: Vec<_> = (0..8u64).map(|i| pool.submit(move || i * i)).collect();
        let results: Vec<_> = handles.into_iter().map(TaskHandle::wait).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }
}
