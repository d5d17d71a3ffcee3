//! A fixed-capacity worker pool used by the multi-op engine to fan out
//! per-server pipelines concurrently (spec §4.7, §2 component H).
//!
//! The original `pymc.threadpool.ThreadPool` this is grounded on spawns a
//! fixed number of OS threads pulling off a shared queue. The idiomatic
//! async-Rust equivalent bounds concurrency with a semaphore instead of
//! pinning work to specific worker tasks: each `submit` spawns a task that
//! first acquires a permit, so at most `workers` submissions ever run at
//! once, and `wait` is a barrier over every submitted task's `JoinHandle`.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a task. Does not block; the task starts running as soon as
    /// a permit is free.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker pool semaphore never closes");
            task.await;
        });
        self.handles.lock().push(handle);
    }

    /// Barrier: returns once every task submitted since the last `wait`
    /// has completed. A task that panics is logged and swallowed rather
    /// than propagated, so one bad per-server pipeline cannot poison the
    /// whole multi-op.
    pub async fn wait(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("worker pool task panicked: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_blocks_until_every_task_finishes() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            pool.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.wait().await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn a_panicking_task_is_logged_and_does_not_poison_the_pool() {
        let pool = WorkerPool::new(2);
        pool.submit(async { panic!("boom") });
        pool.wait().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        pool.submit(async move {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
