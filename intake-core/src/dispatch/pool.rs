//! Bounded, elastic worker pool.
//!
//! `core` workers live for the whole run and share one receiver. When a
//! submission finds the queue full, an extra worker is started as long as
//! fewer than `max` are alive; extra workers exit after sitting idle for
//! `idle_timeout`. Submitting to a full queue awaits a free slot.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::DispatchError;

/// Unit of work run by a pool worker.
pub type Job = BoxFuture<'static, ()>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    pub core_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 2,
            max_workers: 4,
            queue_capacity: 32,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    config: PoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: SharedReceiver,
    tracker: TaskTracker,
    live_workers: Arc<AtomicUsize>,
    next_worker_id: AtomicUsize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("live_workers", &self.live_workers())
            .field("queued", &self.queued())
            .finish()
    }
}

impl WorkerPool {
    /// Start the core workers. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            core_workers: config.core_workers.max(1),
            max_workers: config.max_workers.max(config.core_workers.max(1)),
            queue_capacity: config.queue_capacity.max(1),
            idle_timeout: config.idle_timeout,
        };
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity);
        let pool = Self {
            config,
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            tracker: TaskTracker::new(),
            live_workers: Arc::new(AtomicUsize::new(0)),
            next_worker_id: AtomicUsize::new(0),
        };
        for _ in 0..config.core_workers {
            pool.live_workers.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None);
        }
        pool
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.current_sender()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.current_sender().is_none()
    }

    /// Queue `job`. Awaits while the queue is full; fails once the pool has
    /// been closed.
    pub async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let sender = self.current_sender().ok_or(DispatchError::PoolClosed)?;
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.try_grow();
                sender.send(job).await.map_err(|_| DispatchError::PoolClosed)
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::PoolClosed),
        }
    }

    /// Stop accepting jobs, then wait until every queued and running job has
    /// finished.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);
        self.tracker.close();
        self.tracker.wait().await;
        info!(target: "intake::dispatch", "worker pool drained");
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Job>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn try_grow(&self) {
        let grown = self
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.config.max_workers).then_some(live + 1)
            })
            .is_ok();
        if grown {
            self.spawn_worker(Some(self.config.idle_timeout));
        }
    }

    /// The caller has already counted the worker in `live_workers`.
    fn spawn_worker(&self, idle_timeout: Option<Duration>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let receiver = Arc::clone(&self.receiver);
        let live = Arc::clone(&self.live_workers);
        self.tracker.spawn(async move {
            debug!(target: "intake::dispatch", worker_id, elastic = idle_timeout.is_some(), "worker started");
            loop {
                let next = match idle_timeout {
                    Some(idle) => {
                        match tokio::time::timeout(idle, next_job(&receiver)).await {
                            Ok(job) => job,
                            Err(_) => {
                                debug!(target: "intake::dispatch", worker_id, "idle worker retiring");
                                break;
                            }
                        }
                    }
                    None => next_job(&receiver).await,
                };
                let Some(job) = next else {
                    break;
                };
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(target: "intake::dispatch", worker_id, "job panicked");
                }
            }
            live.fetch_sub(1, Ordering::SeqCst);
            debug!(target: "intake::dispatch", worker_id, "worker stopped");
        });
    }
}

async fn next_job(receiver: &SharedReceiver) -> Option<Job> {
    receiver.lock().await.recv().await
}
