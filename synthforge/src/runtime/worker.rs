use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::EngineResult;
use crate::lifecycle::{ModelLifecycle, TerminalGuard, TrainingOutcome};
use crate::model::{Model, ModelId};
use crate::params::{self, TrainingParams};
use crate::repository::ModelRepository;
use crate::runner::{TaskInvocation, TaskKind, TaskRunner};
use crate::storage::StorageLayout;
use crate::telemetry;

/// A queued request to train one model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingJob {
    pub model_id: ModelId,
    /// Raw payload as submitted; resolved when the job runs.
    pub hyperparameters: Value,
    pub submitted_at: DateTime<Utc>,
}

impl TrainingJob {
    pub fn new(model_id: ModelId, hyperparameters: Value) -> Self {
        Self {
            model_id,
            hyperparameters,
            submitted_at: Utc::now(),
        }
    }
}

/// Everything a pool worker needs to execute a [`TrainingJob`].
pub struct TrainingContext<R: ModelRepository, T: TaskRunner> {
    lifecycle: ModelLifecycle<R>,
    runner: Arc<T>,
    storage: StorageLayout,
    tail_bytes: usize,
}

impl<R: ModelRepository, T: TaskRunner> fmt::Debug for TrainingContext<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingContext")
            .field("runner_type", &std::any::type_name::<T>())
            .field("storage", &self.storage)
            .field("tail_bytes", &self.tail_bytes)
            .finish()
    }
}

impl<R: ModelRepository, T: TaskRunner> TrainingContext<R, T> {
    pub fn new(
        lifecycle: ModelLifecycle<R>,
        runner: Arc<T>,
        storage: StorageLayout,
        tail_bytes: usize,
    ) -> Self {
        Self {
            lifecycle,
            runner,
            storage,
            tail_bytes,
        }
    }

    /// Run one job to a terminal state. Never returns an error; the outcome
    /// is recorded on the model.
    pub async fn execute(&self, job: TrainingJob) -> TrainingOutcome {
        let model_id = job.model_id;
        let params = params::resolve(Some(&job.hyperparameters));

        let model = match self.lifecycle.start(model_id).await {
            Ok(model) => model,
            Err(err) => {
                warn!(model_id = %model_id, error = %err, "training not started");
                telemetry::record_training_finished(model_id, "not_started");
                return TrainingOutcome::NotStarted(err);
            }
        };

        TerminalGuard::new(self.lifecycle.clone(), model_id, self.tail_bytes)
            .run(self.train(&model, &params))
            .await
    }

    async fn train(&self, model: &Model, params: &TrainingParams) -> EngineResult<PathBuf> {
        self.storage.ensure_models_dir().await?;
        let output = self.storage.artifact_path(model.id());

        let invocation = TaskInvocation::new(TaskKind::Train)
            .for_model(model.id())
            .path_flag("--data", &self.storage.dataset_path(model.dataset()))
            .path_flag("--output", &output)
            .flag("--algorithm", model.algorithm())
            .args(params.to_args());

        self.runner.run(invocation).await?;
        Ok(output)
    }
}
