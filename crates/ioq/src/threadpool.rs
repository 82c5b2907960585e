//! Fixed worker pool for blocking or CPU-bound work.
//!
//! Plain OS threads around a mutex+condvar queue of boxed closures.
//! [`ThreadPool::submit`] pairs a closure with a [`Promise`] and returns
//! the matching [`Future`]; combined with
//! [`IoQueue::wait`](crate::IoQueue::wait) that is how the loop offloads
//! work without ever sharing the ring. A process-wide default pool is
//! created lazily and joins when the process exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::future::{Future, Promise};
use crate::queue::IoQueue;

type Job = Box<dyn FnOnce() + Send>;

struct PoolShared {
    jobs: Mutex<VecDeque<Job>>,
    jobs_cv: Condvar,
    running: AtomicBool,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// A pool sized to the hardware, but at least one worker.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(threads)
    }

    pub fn with_threads(num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            jobs: Mutex::new(VecDeque::new()),
            jobs_cv: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("ioq-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning pool worker")
            })
            .collect();
        Self { shared, workers }
    }

    /// Queue a bare job.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        self.shared.jobs.lock().unwrap().push_back(Box::new(job));
        self.shared.jobs_cv.notify_one();
    }

    /// Queue a job and get a future for its result.
    pub fn submit<R: Send + 'static>(
        &self,
        func: impl FnOnce() -> R + Send + 'static,
    ) -> Future<R> {
        let promise = Promise::new();
        let future = promise.future();
        self.push(move || promise.set(func()));
        future
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.jobs_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock().unwrap();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                jobs = shared.jobs_cv.wait(jobs).unwrap();
            }
        };
        job();
    }
}

/// The process-wide pool.
pub fn default_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(ThreadPool::new)
}

/// Run `func` on `pool` and await its result on the loop.
pub fn submit_to<R: Send + 'static>(
    io: &IoQueue,
    pool: &ThreadPool,
    func: impl FnOnce() -> R + Send + 'static,
) -> impl std::future::Future<Output = R> + 'static {
    io.wait(pool.submit(func))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn submit_returns_value() {
        let pool = ThreadPool::with_threads(2);
        let future = pool.submit(|| 1 + 2);
        assert_eq!(future.get(), 3);
    }

    #[test]
    fn many_jobs_all_run() {
        let pool = ThreadPool::with_threads(4);
        let counter = Arc::new(AtomicU32::new(0));
        let futures: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for future in futures {
            future.get();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn drop_joins_idle_workers() {
        let pool = ThreadPool::with_threads(2);
        pool.push(|| {});
        drop(pool);
    }

    #[test]
    fn loop_awaits_pool_result() {
        let io = IoQueue::with_capacity(8).unwrap();
        let pool = ThreadPool::with_threads(1);
        let got = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let got2 = std::rc::Rc::clone(&got);
        let work = submit_to(&io, &pool, || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            99u32
        });
        io.spawn(async move {
            got2.set(work.await);
        });
        io.run();
        assert_eq!(got.get(), 99);
    }

    #[test]
    fn default_pool_is_shared() {
        let a = default_pool() as *const ThreadPool;
        let b = default_pool() as *const ThreadPool;
        assert_eq!(a, b);
    }
}
