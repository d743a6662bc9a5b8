//! Persistence
//!
//! Durable storage for retained messages and persistent sessions behind the
//! narrow [`StorageBackend`] interface. The broker never blocks on the
//! store: writes stream through a bounded fire-and-forget channel to a
//! background task that batches and commits them, and any backend failure is
//! logged, counted and surfaced on the error channel while routing continues
//! from in-memory state.

mod backend;
mod error;
mod memory;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredInflightMessage, StoredPublish, StoredRetainedMessage, StoredSession,
    StoredWill, StoreStats,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Persistence manager that batches writes off the hot path
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    errors: broadcast::Sender<Arc<PersistenceError>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl PersistenceManager {
    /// Create a manager and spawn its background writer task
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (errors, _) = broadcast::channel(64);

        let backend_clone = backend.clone();
        let errors_clone = errors.clone();
        tokio::spawn(Self::writer_loop(
            backend_clone,
            rx,
            shutdown_rx,
            errors_clone,
            flush_interval,
            max_batch_size,
        ));

        Self {
            backend,
            tx,
            errors,
            shutdown_tx,
        }
    }

    /// Fire-and-forget write. A full channel drops the operation rather
    /// than stalling the caller.
    pub fn write(&self, op: PersistenceOp) {
        if self.tx.try_send(op).is_err() {
            warn!("persistence channel full, dropping operation");
        }
    }

    /// Subscribe to backend failures (the out-of-band error channel)
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<PersistenceError>> {
        self.errors.subscribe()
    }

    /// Load all retained messages and sessions at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Look up one stored session
    pub async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        self.backend.get_session(client_id).await
    }

    /// Aggregate store statistics
    pub async fn stats(&self) -> Result<StoreStats> {
        self.backend.stats().await
    }

    /// Flush pending writes and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;

        // Give the writer task time to drain its batch
        tokio::time::sleep(Duration::from_millis(200)).await;

        self.backend.flush().await?;
        self.backend.close().await
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        errors: broadcast::Sender<Arc<PersistenceError>>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        let report = |e: PersistenceError| {
            error!("persistence write failed: {}", e);
            let _ = errors.send(Arc::new(e));
        };

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);

                            if batch.len() >= max_batch_size {
                                if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                                    report(e);
                                }
                            }
                        }
                        None => {
                            if !batch.is_empty() {
                                if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                                    report(e);
                                }
                            }
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !batch.is_empty() {
                        let count = batch.len();
                        if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                            report(e);
                        } else {
                            debug!("flushed {} persistence operations", count);
                        }
                    }
                    if let Err(e) = backend.sweep_expired().await {
                        report(e);
                    }
                }

                _ = shutdown_rx.recv() => {
                    if !batch.is_empty() {
                        let count = batch.len();
                        if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                            report(e);
                        } else {
                            info!("flushed {} persistence operations on shutdown", count);
                        }
                    }
                    break;
                }
            }
        }

        debug!("persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_batches_and_commits() {
        let backend = Arc::new(MemoryBackend::new());
        let manager =
            PersistenceManager::new(backend.clone(), Duration::from_millis(10), 100);

        manager.write(PersistenceOp::SetRetained {
            message: StoredRetainedMessage {
                topic: "a".to_string(),
                payload: vec![1],
                qos: 0,
            },
        });
        manager.write(PersistenceOp::SetRetained {
            message: StoredRetainedMessage {
                topic: "b".to_string(),
                payload: vec![2],
                qos: 1,
            },
        });

        // Wait for the interval flush
        tokio::time::sleep(Duration::from_millis(50)).await;

        let loaded = manager.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 2);
    }
}
