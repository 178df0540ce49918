//! Bounded-concurrency worker pool with an optional shared start-rate gate.
//!
//! Producers [`WorkerPool::submit`] boxed async tasks into a bounded queue; `workers`
//! tokio tasks consume it and publish each outcome on the results stream returned by
//! [`WorkerPool::run`]. The stream closes once every worker has exited, which happens
//! after [`WorkerPool::close`] once the queue is drained, or as soon as the run's
//! cancellation token fires (queued tasks are then dropped unexecuted).
//!
//! Consumers must keep draining the results stream while submitting; a full, unread
//! stream blocks workers and, through the bounded queue, the producer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const RESULT_BUFFER_PER_WORKER: usize = 1024;

pub type TaskResult<T> = anyhow::Result<T>;

/// Stream of task outcomes; closes when all workers have exited.
pub type ResultStream<T> = mpsc::Receiver<TaskResult<T>>;

type Task<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult<T>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
    #[error("worker pool run was cancelled")]
    Cancelled,
}

pub struct WorkerPool<T> {
    workers: usize,
    tasks_tx: Option<mpsc::Sender<Task<T>>>,
    tasks_rx: Arc<Mutex<mpsc::Receiver<Task<T>>>>,
    gate: Arc<RateGate>,
    cancel: CancellationToken,
    catch_panics: bool,
    started: bool,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `workers` and `buffer` are raised to at least 1.
    pub fn new(workers: usize, buffer: usize) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::channel(buffer.max(1));
        Self {
            workers: workers.max(1),
            tasks_tx: Some(tasks_tx),
            tasks_rx: Arc::new(Mutex::new(tasks_rx)),
            gate: Arc::new(RateGate::default()),
            cancel: CancellationToken::new(),
            catch_panics: false,
            started: false,
        }
    }

    /// Convert panics inside tasks into task errors instead of unwinding the worker.
    pub fn with_panic_boundary(mut self) -> Self {
        self.catch_panics = true;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Cap aggregate task starts to `per_second` across all workers; 0 disables the gate.
    pub fn set_rate_limit(&self, per_second: u32) {
        let period = (per_second > 0).then(|| Duration::from_secs(1) / per_second);
        self.gate.set_period(period);
    }

    /// Start the workers. The returned stream must be drained by the caller.
    ///
    /// Calling `run` a second time returns an already-closed stream.
    pub fn run(&mut self, cancel: CancellationToken) -> ResultStream<T> {
        let (results_tx, results_rx) = mpsc::channel(self.workers * RESULT_BUFFER_PER_WORKER);
        if self.started {
            tracing::warn!("worker pool run called twice; returning a closed result stream");
            return results_rx;
        }
        self.started = true;
        self.cancel = cancel;

        for _ in 0..self.workers {
            tokio::spawn(worker_loop(
                self.tasks_rx.clone(),
                results_tx.clone(),
                self.gate.clone(),
                self.cancel.clone(),
                self.catch_panics,
            ));
        }
        results_rx
    }

    /// Enqueue a task, waiting while the queue is full.
    ///
    /// Fails with [`PoolError::Closed`] after [`close`](Self::close) and with
    /// [`PoolError::Cancelled`] once the run's token has fired.
    pub async fn submit<F, Fut>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let tx = self.tasks_tx.as_ref().ok_or(PoolError::Closed)?;
        if self.cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let boxed: Task<T> = Box::new(move |token| task(token).boxed());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PoolError::Cancelled),
            sent = tx.send(boxed) => sent.map_err(|_| PoolError::Closed),
        }
    }

    /// Signal that no more tasks will be submitted. Workers exit once the queue drains.
    pub fn close(&mut self) {
        self.tasks_tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tasks_tx.is_none()
    }
}

async fn worker_loop<T: Send + 'static>(
    tasks: Arc<Mutex<mpsc::Receiver<Task<T>>>>,
    results: mpsc::Sender<TaskResult<T>>,
    gate: Arc<RateGate>,
    cancel: CancellationToken,
    catch_panics: bool,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            task = async { tasks.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            return;
        };

        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = gate.tick() => true,
        };
        if !admitted {
            return;
        }

        let token = cancel.clone();
        let outcome = if catch_panics {
            match AssertUnwindSafe(async move { task(token).await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow::anyhow!("task panicked: {}", panic_message(&panic))),
            }
        } else {
            task(token).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = results.send(outcome) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drain a result stream on a background task, folding every outcome into `init`.
///
/// Resolves once the stream closes.
pub fn spawn_collector<T, A, F>(
    mut results: ResultStream<T>,
    init: A,
    mut fold: F,
) -> tokio::task::JoinHandle<A>
where
    T: Send + 'static,
    A: Send + 'static,
    F: FnMut(&mut A, TaskResult<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut acc = init;
        while let Some(result) = results.recv().await {
            fold(&mut acc, result);
        }
        acc
    })
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Single ticker shared by every worker of a pool.
#[derive(Default)]
struct RateGate {
    period: StdMutex<Option<Duration>>,
    ticker: Mutex<Option<Interval>>,
}

impl RateGate {
    fn set_period(&self, period: Option<Duration>) {
        *self.period.lock().unwrap_or_else(|e| e.into_inner()) = period;
    }

    fn period(&self) -> Option<Duration> {
        *self.period.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn tick(&self) {
        let Some(period) = self.period() else {
            return;
        };
        let mut ticker = self.ticker.lock().await;
        if ticker.as_ref().map(Interval::period) != Some(period) {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            *ticker = Some(interval);
        }
        if let Some(interval) = ticker.as_mut() {
            interval.tick().await;
        }
    }
}
