//! Fixed-size worker pool with ordered result delivery.
//!
//! Block (de)compression is CPU bound and independent per block, so it is
//! handed to a [`WorkerPool`]. Every submitted task gets its own one-slot
//! result channel (a [`Ticket`]). A consumer that keeps its tickets in
//! submission order (an [`OrderedQueue`]) therefore observes results in that
//! order no matter which worker finishes first.
//!
//! # Sharing
//!
//! A pool can be wrapped in an `Arc` and shared by several readers and
//! writers. Submission only needs `&self`. Each reader or writer keeps its
//! own queue of tickets, which is not shared.
//!
//! # Shutdown
//!
//! [`WorkerPool::shutdown`] closes the job channel, lets the workers drain
//! every task already queued, and joins them. Calling it again is a no-op.
//! Dropping the pool shuts it down.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, trace};

use crate::error::{BamError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Number of workers used when zero is requested.
pub fn default_thread_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

struct PoolState {
    jobs: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

/// A fixed set of worker threads executing submitted closures.
pub struct WorkerPool {
    state: Mutex<Option<PoolState>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Start a pool with `threads` workers (`0` picks
    /// [`default_thread_count`]).
    ///
    /// # Errors
    ///
    /// Returns [`BamError::Io`] if a worker thread cannot be spawned.
    pub fn new(threads: usize) -> Result<Self> {
        let thread_count = if threads == 0 {
            default_thread_count()
        } else {
            threads
        };

        let (jobs, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("bamkit-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        // A panicking task drops its result sender; the
                        // ticket holder sees that as a worker error.
                        let _ = panic::catch_unwind(AssertUnwindSafe(job));
                    }
                })?;
            handles.push(handle);
        }
        debug!("started worker pool with {} threads", thread_count);

        Ok(Self {
            state: Mutex::new(Some(PoolState { jobs, handles })),
            thread_count,
        })
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Queue `task` for execution and return a ticket for its result.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::Worker`] if the pool has been shut down.
    pub fn submit<T, F>(&self, task: F) -> Result<Ticket<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The ticket may have been dropped (e.g. after a seek)
            let _ = tx.send(task());
        });

        let guard = self
            .state
            .lock()
            .map_err(|_| BamError::Worker("worker pool lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(state) => state
                .jobs
                .send(job)
                .map_err(|_| BamError::Worker("worker pool has stopped".to_string()))?,
            None => return Err(BamError::Worker("worker pool has been shut down".to_string())),
        }

        Ok(Ticket { result: rx })
    }

    /// Drain queued tasks and join every worker.
    ///
    /// Idempotent: later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::Worker`] if a worker thread itself panicked.
    pub fn shutdown(&self) -> Result<()> {
        let state = match self.state.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(PoolState { jobs, handles }) = state else {
            return Ok(());
        };

        // Closing the channel lets workers exit once the queue is empty
        drop(jobs);
        let mut failed = 0;
        for handle in handles {
            if handle.join().is_err() {
                failed += 1;
            }
        }
        debug!("worker pool shut down ({} threads)", self.thread_count);

        if failed > 0 {
            return Err(BamError::Worker(format!("{} worker threads panicked", failed)));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_count", &self.thread_count)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Handle to the eventual result of one submitted task.
#[derive(Debug)]
pub struct Ticket<T> {
    result: Receiver<T>,
}

impl<T> Ticket<T> {
    /// Block until the task has run and return its value.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::Worker`] if the task panicked.
    pub fn wait(self) -> Result<T> {
        self.result
            .recv()
            .map_err(|_| BamError::Worker("worker task panicked before producing a result".to_string()))
    }
}

/// Bounded FIFO of tickets; results come out in submission order.
#[derive(Debug)]
pub struct OrderedQueue<T> {
    tickets: VecDeque<Ticket<T>>,
    capacity: usize,
}

impl<T> OrderedQueue<T> {
    /// Create a queue holding at most `capacity` outstanding tickets.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tickets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether another ticket may be pushed.
    pub fn has_room(&self) -> bool {
        self.tickets.len() < self.capacity
    }

    /// Number of outstanding tickets.
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Whether no ticket is outstanding.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Append a ticket (callers check [`has_room`](Self::has_room) first).
    pub fn push(&mut self, ticket: Ticket<T>) {
        trace!("queued ticket {} of {}", self.tickets.len() + 1, self.capacity);
        self.tickets.push_back(ticket);
    }

    /// Wait for the oldest ticket. `None` when the queue is empty.
    pub fn pop_wait(&mut self) -> Option<Result<T>> {
        self.tickets.pop_front().map(Ticket::wait)
    }

    /// Forget every outstanding ticket. Their tasks still run to completion.
    pub fn clear(&mut self) {
        self.tickets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_results_delivered_in_submission_order() {
        let pool = WorkerPool::new(4).unwrap();
        let mut queue = OrderedQueue::new(16);
        for i in 0..16u64 {
            // Early tasks sleep longest so they finish last
            queue.push(
                pool.submit(move || {
                    thread::sleep(Duration::from_millis((16 - i) * 3));
                    i
                })
                .unwrap(),
            );
        }
        let mut seen = Vec::new();
        while let Some(result) = queue.pop_wait() {
            seen.push(result.unwrap());
        }
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_threads_uses_default() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.thread_count(), default_thread_count());
    }

    #[test]
    fn test_shutdown_drains_and_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(pool.is_shut_down());
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown().unwrap();
        assert!(matches!(pool.submit(|| 1), Err(BamError::Worker(_))));
    }

    #[test]
    fn test_panicking_task_surfaces_at_ticket() {
        let pool = WorkerPool::new(1).unwrap();
        let bad = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        let good = pool.submit(|| 7u32).unwrap();
        assert!(matches!(bad.wait(), Err(BamError::Worker(_))));
        // The worker survived the panic
        assert_eq!(good.wait().unwrap(), 7);
    }

    #[test]
    fn test_shared_pool_across_threads() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut queue = OrderedQueue::new(8);
                    for i in 0..8 {
                        queue.push(pool.submit(move || t * 100 + i).unwrap());
                    }
                    let mut out = Vec::new();
                    while let Some(v) = queue.pop_wait() {
                        out.push(v.unwrap());
                    }
                    out
                })
            })
            .collect();
        for (t, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap();
            assert_eq!(out, (0..8).map(|i| t * 100 + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_queue_capacity() {
        let pool = WorkerPool::new(1).unwrap();
        let mut queue = OrderedQueue::new(2);
        assert!(queue.has_room());
        queue.push(pool.submit(|| 1).unwrap());
        queue.push(pool.submit(|| 2).unwrap());
        assert!(!queue.has_room());
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }
}
