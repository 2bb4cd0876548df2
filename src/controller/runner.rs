//! Watch ingestion and the worker pool
//!
//! One task turns watch notifications into queue keys, restarting the watch
//! with a full relist whenever it fails. A fixed number of workers pull keys
//! from the queue; each attempt runs in its own task so that a panic or a
//! timeout is contained to that key.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::queue::{WorkItem, WorkQueue};
use super::reconciler::{reconcile, ReconcileAction};
use crate::error::{Error, Result};
use crate::store::ObjectKey;

/// The Database controller: queue, watch ingestion and workers
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
}

impl Controller {
    pub fn new(ctx: Context) -> Self {
        let queue = WorkQueue::new(
            ctx.config.backoff.clone(),
            ctx.config.forbidden_backoff.clone(),
        );
        Self {
            ctx: Arc::new(ctx),
            queue: Arc::new(queue),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until `shutdown` resolves, then let in-flight attempts finish
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let workers = self.ctx.config.workers.max(1);
        info!("Starting Database controller with {} workers", workers);

        let ingest = tokio::spawn(ingest(self.ctx.clone(), self.queue.clone()));
        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(worker(id, self.ctx.clone(), self.queue.clone())))
            .collect();

        shutdown.await;
        info!("Shutting down Database controller");
        self.queue.shutdown();
        ingest.abort();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn ingest(ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    let restart_delay = ctx.config.watch_restart_delay;
    loop {
        // Subscribe before listing so nothing falls between the two.
        let mut events = ctx.store.watch();
        match ctx.store.list().await {
            Ok(keys) => {
                debug!("Relisted {} Databases", keys.len());
                for key in keys {
                    queue.enqueue(key);
                }
            }
            Err(e) => {
                warn!("Failed to list Databases: {}, retrying in {:?}", e, restart_delay);
                tokio::time::sleep(restart_delay).await;
                continue;
            }
        }

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => queue.enqueue(event.key),
                Err(e) => {
                    warn!("Watch failed: {}", e);
                    break;
                }
            }
            #[cfg(feature = "metrics")]
            super::metrics::set_queue_depth(queue.len());
        }

        if queue.is_shutdown() {
            return;
        }
        warn!("Watch stream ended, restarting in {:?}", restart_delay);
        tokio::time::sleep(restart_delay).await;
    }
}

async fn worker(id: usize, ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    while let Some(item) = queue.dequeue().await {
        #[cfg(feature = "metrics")]
        super::metrics::set_queue_depth(queue.len());

        let started = Instant::now();
        let result = run_attempt(&ctx, &item).await;
        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration_seconds(started.elapsed().as_secs_f64());
        debug!(key = %item.key, worker = id, "Attempt took {:?}", started.elapsed());

        settle(&ctx, &queue, &item.key, result);
    }
    debug!("Worker {} stopped", id);
}

/// Run one attempt in its own task, bounded by the reconcile timeout
async fn run_attempt(ctx: &Arc<Context>, item: &WorkItem) -> Result<ReconcileAction> {
    let task_ctx = ctx.clone();
    let key = item.key.clone();
    let attempt = item.attempt;
    let mut handle = tokio::spawn(async move { reconcile(&task_ctx, &key, attempt).await });

    let timeout = ctx.config.reconcile_timeout;
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(key = %item.key, "Reconciliation panicked: {}", message);
            Err(Error::Panicked(message))
        }
        Ok(Err(e)) => Err(Error::Panicked(e.to_string())),
        Err(_) => {
            handle.abort();
            // Wait for the abort so the key is never reconciled twice at once.
            let _ = handle.await;
            Err(Error::Timeout(timeout))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn settle(ctx: &Context, queue: &WorkQueue, key: &ObjectKey, result: Result<ReconcileAction>) {
    match result {
        Ok(ReconcileAction::Converged) => queue.done(key, Some(ctx.config.resync_interval)),
        Ok(ReconcileAction::Progressing) => queue.done(key, Some(ctx.config.progress_interval)),
        Ok(ReconcileAction::Forget) | Ok(ReconcileAction::Stalled) => queue.forget(key),
        Err(e) => {
            #[cfg(feature = "metrics")]
            super::metrics::inc_reconcile_error(e.kind());

            if !e.is_retriable() {
                error!(key = %key, "Reconciliation failed permanently: {}", e);
                queue.forget(key);
                return;
            }
            let delay = queue.failed(key, e.retry_kind());
            match e {
                Error::StatusConflict(_) | Error::CleanupPending(_) => {
                    debug!(key = %key, "Requeued in {:?}: {}", delay, e)
                }
                _ => warn!(key = %key, "Reconciliation failed, retrying in {:?}: {}", delay, e),
            }
        }
    }
}
