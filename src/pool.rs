use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error)]
#[error("task ended without producing a result")]
pub struct TaskLost;

/// Result of a submitted task, resolved when the task finishes.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskLost>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| TaskLost))
    }
}

/// Fixed set of workers pulling from a bounded queue.
///
/// When the queue is full the submitter runs the task itself and only
/// returns once it is done, which throttles producers to the pool's pace.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    capacity: usize,
    inline_runs: AtomicU64,
}

impl WorkerPool {
    /// Must be called inside a Tokio runtime.
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        // A panicking job must not take the worker down with it.
                        if let Err(e) = tokio::spawn(job).await {
                            warn!(worker = id, "task aborted: {}", e);
                        }
                    }
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();

        WorkerPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
            capacity,
            inline_runs: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        match self.sender() {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    /// Tasks the submitter had to run because the queue was full.
    pub fn inline_runs(&self) -> u64 {
        self.inline_runs.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    pub async fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // Receiver may be gone if the caller stopped waiting.
            let _ = done.send(task.await);
        });

        let rejected = match self.sender() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => None,
                Err(TrySendError::Full(job)) => {
                    self.inline_runs.fetch_add(1, Ordering::Relaxed);
                    debug!("queue full, running task on the submitter");
                    Some(job)
                }
                Err(TrySendError::Closed(job)) => Some(job),
            },
            None => Some(job),
        };
        if let Some(job) = rejected {
            if let Err(e) = tokio::spawn(job).await {
                warn!("task aborted: {}", e);
            }
        }
        TaskHandle { rx }
    }

    /// Close the queue and wait for the workers to finish what was queued.
    /// Later submissions run on the submitter.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}
