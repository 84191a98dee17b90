//! Bounded dispatch queue drained by a fixed pool of workers.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::NotificationRequest;

use crate::clock::Clock;
use crate::dispatch::{DispatchError, DispatchOutcome, Dispatcher};

#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<NotificationRequest>,
    rx: Arc<Mutex<mpsc::Receiver<NotificationRequest>>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueue without waiting; a full queue is reported as backpressure.
    pub fn submit(&self, request: NotificationRequest) -> Result<Uuid, AppError> {
        let id = request.id;
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AppError::Backpressure("dispatch queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                AppError::Internal("dispatch queue is closed".to_string())
            }
        })?;
        tracing::debug!(request_id = %id, "Request queued");
        Ok(id)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn spawn_workers(
        &self,
        workers: usize,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let dispatcher = dispatcher.clone();
                let clock = clock.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { queue.work(worker, dispatcher, clock, shutdown).await })
            })
            .collect()
    }

    async fn work(
        self,
        worker: usize,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(worker, "Dispatch worker started");
        loop {
            let next = tokio::select! {
                request = async { self.rx.lock().await.recv().await } => request,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(request) = next else {
                break;
            };

            match dispatcher.dispatch(&request).await {
                Ok(DispatchOutcome::Delivered { .. }) => {}
                Ok(DispatchOutcome::Deferred { retry_at }) => {
                    let wait = (retry_at - clock.now()).to_std().unwrap_or_default();
                    self.requeue_after(request, wait);
                }
                // Already logged with the audit flag by the dispatcher.
                Err(DispatchError::Undeliverable { .. }) => {}
                Err(e) => {
                    tracing::error!(
                        worker,
                        request_id = %request.id,
                        error = %e,
                        "Queued request rejected"
                    );
                }
            }
        }
        tracing::debug!(worker, "Dispatch worker stopped");
    }

    /// Put a request back on the queue once `wait` has passed.
    pub fn requeue_after(&self, request: NotificationRequest, wait: std::time::Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let id = request.id;
            if tx.send(request).await.is_err() {
                tracing::warn!(
                    request_id = %id,
                    "Queue closed before deferred request was retried"
                );
            }
        });
    }
}
