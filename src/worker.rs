use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::*;

use crate::controller::Diagnostics;
use crate::queue::WorkQueue;
use crate::reconciler::Reconcile;
use crate::{Error, ObjectKey, Result};

/// Spawn `count` workers draining `queue`. Each worker exits once the queue
/// is shut down and its current reconcile has finished.
pub fn spawn_workers<R: Reconcile + 'static>(
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
    count: usize,
    timeout: Duration,
    diagnostics: Arc<RwLock<Diagnostics>>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            let diagnostics = diagnostics.clone();
            tokio::spawn(async move {
                debug!("Worker {} started", id);
                while let Some(key) = queue.get().await {
                    let res = process_item(&queue, reconciler.as_ref(), &key, timeout).await;
                    diagnostics.write().await.record(&key, &res, queue.len());
                }
                debug!("Worker {} stopped", id);
            })
        })
        .collect()
}

/// Reconcile one key handed out by `queue` and report the outcome back.
///
/// A zero `timeout` disables the per call deadline.
pub async fn process_item<R: Reconcile + ?Sized>(
    queue: &WorkQueue<ObjectKey>,
    reconciler: &R,
    key: &ObjectKey,
    timeout: Duration,
) -> Result<()> {
    let res = if timeout.is_zero() {
        reconciler.reconcile(key).await
    } else {
        tokio::time::timeout(timeout, reconciler.reconcile(key))
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(key.to_string(), timeout)))
    };

    match &res {
        Ok(()) => {
            queue.done(key);
            queue.forget(key);
        }
        Err(e) if e.is_permanent() => {
            warn!("Dropping {}: {}", key, e);
            queue.done(key);
            queue.forget(key);
        }
        Err(e) => {
            warn!(
                "reconcile failed for {} (attempt {}): {}",
                key,
                queue.num_requeues(key) + 1,
                e
            );
            queue.done(key);
            queue.add_rate_limited(key.clone());
        }
    }
    res
}
