//! # Worker Pool
//!
//! Runs CPU-heavy tasks off the control thread and hands their results back
//! to it.
//!
//! ## Architecture
//!
//! ```text
//!  CONTROL THREAD                          WORKER THREADS
//! ┌──────────────────┐   job channel    ┌──────────────────┐
//! │ submit()         │ ───────────────► │ task.run()       │
//! │  pending[id] =   │                  │  (snapshot only) │
//! │   continuation   │   done channel   │                  │
//! │ drain()          │ ◄─────────────── │ (id, outcome)    │
//! │  continuation(…) │                  └──────────────────┘
//! └──────────────────┘
//! ```
//!
//! Workers only ever see the task's immutable inputs. Continuations stay on
//! the control side and run inside [`WorkerPool::drain_completions`], so
//! everything they touch is single-writer.

mod task;

pub use task::{CellRequestCompletion, CellWorkerTask, PreparationFailureHandler};

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{DeliveryError, DeliveryResult, TaskFailure};

/// Identifier of a submitted task.
pub type TaskId = u64;

/// Work executed on a worker thread.
pub trait WorkerTask: Send + 'static {
    /// Produces the task's output. Must not touch shared mutable state.
    ///
    /// # Errors
    ///
    /// Any [`TaskFailure`] is routed to [`TaskCompletion::on_failure`].
    fn run(&self) -> Result<Vec<u8>, TaskFailure>;
}

/// Control-thread half of a task.
pub trait TaskCompletion: Send + 'static {
    /// The task produced `output`.
    fn on_completion(self: Box<Self>, output: Vec<u8>) -> Vec<DeliveryError>;

    /// The task failed or its worker panicked.
    fn on_failure(self: Box<Self>, failure: TaskFailure) -> Vec<DeliveryError>;
}

struct Job {
    id: TaskId,
    task: Box<dyn WorkerTask>,
}

struct Done {
    id: TaskId,
    outcome: Result<Vec<u8>, TaskFailure>,
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker thread count.
    pub threads: usize,
    /// Tasks accepted.
    pub submitted: u64,
    /// Tasks whose completion ran.
    pub completed: u64,
    /// Tasks whose failure handler ran.
    pub failed: u64,
}

/// Result of processing finished tasks on the control thread.
#[derive(Debug, Default)]
pub struct Drained {
    /// Continuations that ran.
    pub processed: usize,
    /// Errors reported by those continuations.
    pub errors: Vec<DeliveryError>,
}

impl Drained {
    fn absorb(&mut self, errors: Vec<DeliveryError>) {
        self.processed += 1;
        self.errors.extend(errors);
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    job_tx: Mutex<Option<Sender<Job>>>,
    done_rx: Receiver<Done>,
    pending: Mutex<HashMap<TaskId, Box<dyn TaskCompletion>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    next_id: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerPool {
    /// Starts `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// [`DeliveryError::WorkerSpawn`] if the OS refuses a thread.
    pub fn new(threads: usize) -> DeliveryResult<Self> {
        let threads = threads.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Done>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cell-worker-{index}"))
                .spawn(move || worker_loop(&job_rx, &done_tx))
                .map_err(|e| DeliveryError::WorkerSpawn(e.to_string()))?;
            workers.push(handle);
        }

        tracing::debug!("Worker pool started with {} threads", threads);

        Ok(Self {
            job_tx: Mutex::new(Some(job_tx)),
            done_rx,
            pending: Mutex::new(HashMap::new()),
            workers: Mutex::new(workers),
            threads,
            next_id: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Queues a task. `completion` runs on the control thread during a later
    /// [`WorkerPool::drain_completions`] or [`WorkerPool::flush`].
    ///
    /// # Errors
    ///
    /// [`DeliveryError::PoolClosed`] after [`WorkerPool::shutdown`].
    pub fn submit(
        &self,
        task: impl WorkerTask,
        completion: impl TaskCompletion,
    ) -> DeliveryResult<TaskId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, Box::new(completion));

        let sent = match self.job_tx.lock().as_ref() {
            Some(tx) => tx
                .send(Job {
                    id,
                    task: Box::new(task),
                })
                .is_ok(),
            None => false,
        };

        if !sent {
            self.pending.lock().remove(&id);
            return Err(DeliveryError::PoolClosed);
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Runs the continuations of every task that finished so far. Never
    /// blocks.
    pub fn drain_completions(&self) -> Drained {
        let mut drained = Drained::default();
        while let Ok(done) = self.done_rx.try_recv() {
            let errors = self.finish(done);
            drained.absorb(errors);
        }
        drained
    }

    /// Blocks until no task is outstanding or `timeout` passes. Tasks that
    /// continuations submit while flushing (restarts) are waited for too.
    pub fn flush(&self, timeout: Duration) -> Drained {
        let deadline = Instant::now() + timeout;
        let mut drained = self.drain_completions();

        while self.pending_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(done) => {
                    let errors = self.finish(done);
                    drained.absorb(errors);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("Flush timed out with {} tasks outstanding", self.pending_count());
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drained
    }

    fn finish(&self, done: Done) -> Vec<DeliveryError> {
        let Some(completion) = self.pending.lock().remove(&done.id) else {
            tracing::warn!("Completion for unknown task {}", done.id);
            return Vec::new();
        };

        match done.outcome {
            Ok(output) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                completion.on_completion(output)
            }
            Err(failure) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                completion.on_failure(failure)
            }
        }
    }

    /// Tasks submitted whose continuation has not run yet.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns a counter snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.threads,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting tasks and joins the workers. Queued jobs still run;
    /// their continuations are dropped with the pool.
    pub fn shutdown(&self) {
        if self.job_tx.lock().take().is_none() {
            return;
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread exited abnormally");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(job_rx: &Receiver<Job>, done_tx: &Sender<Done>) {
    while let Ok(job) = job_rx.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.task.run()))
            .unwrap_or_else(|_| Err(TaskFailure("worker panicked".to_owned())));

        if done_tx.send(Done { id: job.id, outcome }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Echo(Vec<u8>);

    impl WorkerTask for Echo {
        fn run(&self) -> Result<Vec<u8>, TaskFailure> {
            Ok(self.0.clone())
        }
    }

    struct Fail;

    impl WorkerTask for Fail {
        fn run(&self) -> Result<Vec<u8>, TaskFailure> {
            Err(TaskFailure("nope".to_owned()))
        }
    }

    struct Explode;

    impl WorkerTask for Explode {
        fn run(&self) -> Result<Vec<u8>, TaskFailure> {
            panic!("boom");
        }
    }

    struct Record(Arc<Mutex<Vec<String>>>);

    impl TaskCompletion for Record {
        fn on_completion(self: Box<Self>, output: Vec<u8>) -> Vec<DeliveryError> {
            self.0.lock().push(format!("ok:{}", output.len()));
            Vec::new()
        }

        fn on_failure(self: Box<Self>, failure: TaskFailure) -> Vec<DeliveryError> {
            self.0.lock().push(failure.0);
            vec![DeliveryError::PoolClosed]
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_completion_runs_on_flush() {
        let pool = WorkerPool::new(2).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.submit(Echo(vec![1, 2, 3]), Record(Arc::clone(&log))).unwrap();
        let drained = pool.flush(WAIT);

        assert_eq!(drained.processed, 1);
        assert!(drained.errors.is_empty());
        assert_eq!(*log.lock(), vec!["ok:3"]);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_failure_routes_to_failure_handler() {
        let pool = WorkerPool::new(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.submit(Fail, Record(Arc::clone(&log))).unwrap();
        let drained = pool.flush(WAIT);

        assert_eq!(drained.errors, vec![DeliveryError::PoolClosed]);
        assert_eq!(*log.lock(), vec!["nope"]);
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_panicking_task_is_a_failure() {
        let pool = WorkerPool::new(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.submit(Explode, Record(Arc::clone(&log))).unwrap();
        pool.flush(WAIT);

        assert_eq!(*log.lock(), vec!["worker panicked"]);

        // The worker survives and keeps serving.
        pool.submit(Echo(vec![0]), Record(Arc::clone(&log))).unwrap();
        pool.flush(WAIT);
        assert_eq!(log.lock().last().map(String::as_str), Some("ok:1"));
    }

    #[test]
    fn test_stats_and_shutdown() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.stats().threads, 1);

        let log = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..10 {
            pool.submit(Echo(vec![7; 4]), Record(Arc::clone(&log))).unwrap();
        }
        pool.flush(WAIT);

        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);

        pool.shutdown();
        assert_eq!(
            pool.submit(Echo(Vec::new()), Record(log)).unwrap_err(),
            DeliveryError::PoolClosed
        );
        assert_eq!(pool.pending_count(), 0);
    }
}
