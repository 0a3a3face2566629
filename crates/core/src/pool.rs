//! Fixed-size worker pool.
//!
//! Submissions go into an unbounded FIFO queue drained by exactly
//! `nb_workers` long-lived tasks, which bounds the number of hooks running
//! at once without ever blocking the submitter. Each worker runs the
//! request to completion and then hands it to the notification dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::error::HookError;
use crate::notify::NotificationDispatcher;
use crate::runner::HookRunner;
use crate::types::HookId;
use crate::work::WorkRequest;

type Queue = mpsc::UnboundedSender<Arc<WorkRequest>>;
type Registry = Arc<Mutex<HashMap<HookId, Arc<WorkRequest>>>>;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub running: usize,
    pub queued: usize,
}

/// How [`WorkerPool::shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every accepted request finished within the grace window.
    Drained,
    /// The grace window expired; this many requests were cancelled.
    Cancelled(usize),
}

pub struct WorkerPool {
    queue: Mutex<Option<Queue>>,
    registry: Registry,
    running: Arc<AtomicUsize>,
    workers: TaskTracker,
    nb_workers: usize,
}

impl WorkerPool {
    /// Spawn `nb_workers` workers (at least one) on the current runtime.
    pub fn start(
        nb_workers: usize,
        runner: Arc<HookRunner>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let nb_workers = nb_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let registry: Registry = Arc::default();
        let running = Arc::new(AtomicUsize::new(0));
        let workers = TaskTracker::new();

        for worker_id in 0..nb_workers {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&runner),
                Arc::clone(&dispatcher),
                Arc::clone(&registry),
                Arc::clone(&running),
            ));
        }
        workers.close();

        tracing::info!(nb_workers, "Worker pool started");

        Self {
            queue: Mutex::new(Some(tx)),
            registry,
            running,
            workers,
            nb_workers,
        }
    }

    /// Enqueue a request. Never blocks; fails once shutdown has begun.
    pub fn submit(&self, req: Arc<WorkRequest>) -> Result<(), HookError> {
        let queue = lock(&self.queue);
        let Some(tx) = queue.as_ref() else {
            return Err(HookError::ShutdownInProgress);
        };

        lock(&self.registry).insert(req.id(), Arc::clone(&req));
        if let Err(mpsc::error::SendError(req)) = tx.send(req) {
            lock(&self.registry).remove(&req.id());
            return Err(HookError::ShutdownInProgress);
        }
        Ok(())
    }

    pub fn nb_workers(&self) -> usize {
        self.nb_workers
    }

    /// Number of hooks currently running.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let accepted = lock(&self.registry).len();
        let running = self.running();
        PoolStats {
            workers: self.nb_workers,
            running,
            queued: accepted.saturating_sub(running),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.queue).is_none()
    }

    /// Stop accepting submissions and let the workers drain the queue for
    /// at most `grace`, then cancel whatever is left and wait for the
    /// workers to exit.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        // Dropping the sender lets the workers exit once the queue is empty.
        lock(&self.queue).take();
        tracing::info!(grace_secs = grace.as_secs(), "Worker pool shutting down");

        if tokio::time::timeout(grace, self.workers.wait()).await.is_ok() {
            tracing::info!("Worker pool drained");
            return ShutdownOutcome::Drained;
        }

        let pending: Vec<Arc<WorkRequest>> = lock(&self.registry).values().cloned().collect();
        for req in &pending {
            tracing::warn!(hook = %req.name(), hook_id = req.id(), "Cancelling hook at shutdown");
            req.cancel();
        }
        self.workers.wait().await;
        tracing::info!(cancelled = pending.len(), "Worker pool stopped");
        ShutdownOutcome::Cancelled(pending.len())
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<WorkRequest>>>>,
    runner: Arc<HookRunner>,
    dispatcher: Arc<NotificationDispatcher>,
    registry: Registry,
    running: Arc<AtomicUsize>,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        let next = rx.lock().await.recv().await;
        let Some(req) = next else {
            break;
        };

        tracing::debug!(worker_id, hook = %req.name(), hook_id = req.id(), "Hook dequeued");
        running.fetch_add(1, Ordering::AcqRel);
        let status = runner.run(&req).await;
        running.fetch_sub(1, Ordering::AcqRel);
        lock(&registry).remove(&req.id());

        tracing::debug!(worker_id, hook_id = req.id(), status = %status, "Hook handed to notifiers");
        dispatcher.dispatch(req);
    }
    tracing::debug!(worker_id, "Worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
