//! Fixed pool of event-loop workers sharing one ready queue.
//!
//! An [`EventLoopPool`] is constructed explicitly and passed to every
//! component that needs it — there is no process-wide instance, so tests
//! can run several independent pools side by side.
//!
//! Workers call [`run`](EventLoopPool::run) concurrently and pull tasks off
//! a single shared queue; the queue's receiver behind an async mutex is the
//! only structure the workers mutate concurrently. Each task is spawned
//! onto the runtime and tracked to completion, so a long-lived task never
//! pins its worker and the queue keeps draining. A task that resolves to an
//! error, or panics, is logged and the worker keeps going; task failures
//! never terminate a worker, let alone the process.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

/// Boxed error type tasks may resolve to.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type Task = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Errors produced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("event loop pool is stopped")]
    Closed,
}

/// A fixed set of workers executing queued asynchronous tasks.
pub struct EventLoopPool {
    sender: StdMutex<Option<mpsc::UnboundedSender<Task>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Task>>,
    workers: usize,
}

impl EventLoopPool {
    /// Creates a pool sized for `workers` concurrent workers.
    ///
    /// No workers run yet; call [`start`](Self::start) to spawn them, or
    /// drive [`run`](Self::run) from tasks of your own.
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: StdMutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            workers: workers.max(1),
        }
    }

    /// Returns the number of workers this pool was sized for.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enqueues a task for execution by the next free worker.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] once [`stop`](Self::stop) has been called.
    pub fn spawn<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(sender) => sender.send(Box::pin(task)).map_err(|_| PoolError::Closed),
            None => Err(PoolError::Closed),
        }
    }

    /// Blocks the calling worker, executing queued tasks until the pool is
    /// stopped and every task it picked up has finished.
    ///
    /// Any number of workers may call this concurrently; each pulls
    /// independent tasks off the shared queue. Tasks run concurrently: a
    /// task that lives for a long time (a connection that stays open, say)
    /// never stops this worker from picking up the next one. A task error,
    /// or a task panic, is logged and the loop continues.
    pub async fn run(&self) {
        let mut running = JoinSet::new();
        loop {
            let next = async {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            tokio::select! {
                task = next => {
                    let Some(task) = task else {
                        debug!("worker draining: pool stopped");
                        break;
                    };
                    running.spawn(task);
                }
                Some(finished) = running.join_next(), if !running.is_empty() => {
                    log_outcome(finished);
                }
            }
        }
        while let Some(finished) = running.join_next().await {
            log_outcome(finished);
        }
    }

    /// Spawns `workers` tokio tasks, each driving [`run`](Self::run).
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.workers {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.run().await });
        }
    }

    /// Stops the pool: no further tasks are accepted, workers drain the
    /// remaining queue and return. Idempotent.
    pub fn stop(&self) {
        let mut guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.take().is_some() {
            debug!("event loop pool stopped");
        }
    }
}

fn log_outcome(outcome: Result<Result<(), TaskError>, JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "queued task failed"),
        Err(e) if e.is_panic() => error!(error = %e, "queued task panicked"),
        Err(e) => error!(error = %e, "queued task cancelled"),
    }
}
