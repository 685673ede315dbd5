//! Process-wide media worker
//!
//! The worker is created on first use and shared by every room for the life
//! of the process. Its death is unrecoverable: the supervisor records the
//! reason and publishes it so the host process can shut down.

use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info};

use crate::engine::{MediaEngine, MediaWorker, WorkerSettings};
use crate::error::{Result, SfuError};

pub struct WorkerSupervisor {
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    worker: OnceCell<Arc<dyn MediaWorker>>,
    death_tx: Arc<watch::Sender<Option<String>>>,
}

impl WorkerSupervisor {
    pub fn new(engine: Arc<dyn MediaEngine>, settings: WorkerSettings) -> Self {
        let (death_tx, _) = watch::channel(None);
        Self {
            engine,
            settings,
            worker: OnceCell::new(),
            death_tx: Arc::new(death_tx),
        }
    }

    #[must_use]
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// The shared worker, created on the first call
    pub async fn get(&self) -> Result<Arc<dyn MediaWorker>> {
        if let Some(reason) = self.death_reason() {
            return Err(SfuError::WorkerUnavailable(format!("worker died: {reason}")));
        }

        let worker = self
            .worker
            .get_or_try_init(|| async {
                let worker = self
                    .engine
                    .create_worker(&self.settings)
                    .await
                    .map_err(|e| SfuError::WorkerUnavailable(e.to_string()))?;

                let death_tx = Arc::clone(&self.death_tx);
                let worker_id = worker.id();
                worker.on_dead(Box::new(move |reason: String| {
                    error!(worker_id = %worker_id, reason = %reason, "Media worker died");
                    death_tx.send_replace(Some(reason));
                }));

                info!(
                    engine = self.engine.name(),
                    worker_id = %worker.id(),
                    "Media worker started"
                );
                Ok::<_, SfuError>(worker)
            })
            .await?;

        Ok(Arc::clone(worker))
    }

    /// Resolves with the reason once the worker has died
    #[must_use]
    pub fn subscribe_death(&self) -> watch::Receiver<Option<String>> {
        self.death_tx.subscribe()
    }

    #[must_use]
    pub fn death_reason(&self) -> Option<String> {
        self.death_tx.borrow().clone()
    }
}
