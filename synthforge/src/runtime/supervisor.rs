use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TrainingPoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::ModelId;
use crate::repository::ModelRepository;
use crate::runner::TaskRunner;
use crate::telemetry;

use super::worker::{TrainingContext, TrainingJob};

/// Token for signaling shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Registered before the flag check so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded worker pool executing training jobs.
///
/// `workers` tasks share one bounded queue of `queue_capacity` slots.
/// Submissions never block: a full queue is reported as
/// [`EngineError::PoolSaturated`].
pub struct TrainingPool<R: ModelRepository, T: TaskRunner> {
    config: TrainingPoolConfig,
    sender: parking_lot::Mutex<Option<mpsc::Sender<TrainingJob>>>,
    context: Arc<TrainingContext<R, T>>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: ModelRepository, T: TaskRunner> fmt::Debug for TrainingPool<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("TrainingPool")
            .field("config", &self.config)
            .field("worker_count", &worker_count)
            .field("queued", &self.queued())
            .field("accepting", &self.is_accepting())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<R: ModelRepository, T: TaskRunner> TrainingPool<R, T> {
    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(config: TrainingPoolConfig, context: Arc<TrainingContext<R, T>>) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown_token = ShutdownToken::new();

        let handles = (0..workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let context = Arc::clone(&context);
                let shutdown = shutdown_token.clone();
                tokio::spawn(Self::worker_loop(worker, receiver, context, shutdown))
            })
            .collect();

        info!(workers, queue_capacity = config.queue_capacity, "training pool started");

        Self {
            config,
            sender: parking_lot::Mutex::new(Some(sender)),
            context,
            shutdown_token,
            worker_handles: Mutex::new(handles),
        }
    }

    pub fn config(&self) -> &TrainingPoolConfig {
        &self.config
    }

    pub fn context(&self) -> Arc<TrainingContext<R, T>> {
        Arc::clone(&self.context)
    }

    /// Queue a model for training and return immediately.
    pub fn train_async(&self, model_id: ModelId, hyperparameters: Value) -> EngineResult<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(EngineError::PoolClosed)?;
        sender
            .try_send(TrainingJob::new(model_id, hyperparameters))
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::PoolSaturated {
                    capacity: self.config.queue_capacity,
                },
                TrySendError::Closed(_) => EngineError::PoolClosed,
            })?;
        debug!(model_id = %model_id, "training job queued");
        Ok(())
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or_default()
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    ///
    /// Each worker gets `shutdown_timeout_secs`; a worker that overruns is
    /// told to stop after its current job and left running detached.
    pub async fn shutdown(&self) {
        info!("initiating training pool shutdown");

        self.sender.lock().take();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("training worker failed: {:?}", e),
                Err(_) => {
                    warn!("training worker timed out during shutdown");
                    self.shutdown_token.cancel();
                }
            }
        }

        self.shutdown_token.cancel();
        info!("training pool shutdown complete");
    }

    async fn worker_loop(
        worker: usize,
        receiver: Arc<Mutex<mpsc::Receiver<TrainingJob>>>,
        context: Arc<TrainingContext<R, T>>,
        shutdown: ShutdownToken,
    ) {
        loop {
            let job = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    job = receiver.recv() => job,
                }
            };

            let Some(job) = job else {
                debug!(worker, "training worker exiting");
                break;
            };

            let model_id = job.model_id;
            let queued_for = chrono::Utc::now() - job.submitted_at;
            debug!(
                worker,
                model_id = %model_id,
                queued_ms = queued_for.num_milliseconds(),
                "training job picked up"
            );

            let outcome =
                telemetry::instrument_training(worker, model_id, context.execute(job)).await;
            debug!(worker, model_id = %model_id, outcome = outcome.label(), "training job done");
        }
    }
}
