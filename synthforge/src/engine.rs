use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::ModelEvent;
use crate::generation::{AnomalySpec, GenerationOrchestrator, GenerationOutput};
use crate::lifecycle::ModelLifecycle;
use crate::model::{Algorithm, DatasetId, DatasetRef, Model, ModelId, ModelStatus, TrainingFailure};
use crate::repository::ModelRepository;
use crate::runner::TaskRunner;
use crate::runtime::TrainingPool;
use crate::stats::StatsCache;

/// What collaborators need to know about a model without loading all of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusView {
    pub id: ModelId,
    pub status: ModelStatus,
    pub artifact_available: bool,
    pub artifact_path: Option<PathBuf>,
    pub failure: Option<TrainingFailure>,
}

impl From<&Model> for ModelStatusView {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id(),
            status: model.status(),
            artifact_available: model.artifact_path().is_some(),
            artifact_path: model.artifact_path().map(Path::to_path_buf),
            failure: model.failure().cloned(),
        }
    }
}

/// Entry point for collaborators: submit training, poll status, generate,
/// evaluate and fetch dataset statistics.
///
/// Construct with [`crate::runtime::EngineBuilder`].
pub struct Engine<R: ModelRepository, T: TaskRunner> {
    config: EngineConfig,
    lifecycle: ModelLifecycle<R>,
    pool: TrainingPool<R, T>,
    generation: GenerationOrchestrator<R, T>,
    stats: StatsCache<T>,
}

impl<R: ModelRepository, T: TaskRunner> fmt::Debug for Engine<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("repository_type", &std::any::type_name::<R>())
            .field("runner_type", &std::any::type_name::<T>())
            .field("pool", &self.pool)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<R: ModelRepository, T: TaskRunner> Engine<R, T> {
    pub(crate) fn new(
        config: EngineConfig,
        lifecycle: ModelLifecycle<R>,
        pool: TrainingPool<R, T>,
        generation: GenerationOrchestrator<R, T>,
        stats: StatsCache<T>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            pool,
            generation,
            stats,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &ModelLifecycle<R> {
        &self.lifecycle
    }

    pub fn repository(&self) -> Arc<R> {
        self.lifecycle.repository()
    }

    /// Create a model for `dataset` and queue it for training.
    ///
    /// Returns as soon as the model is persisted and queued. If the queue is
    /// full the model is kept `PENDING` and `PoolSaturated` is returned;
    /// retry later with [`Engine::enqueue_training`].
    pub async fn submit_training(
        &self,
        dataset: DatasetRef,
        algorithm: &str,
        hyperparameters: Value,
    ) -> EngineResult<ModelId> {
        let algorithm: Algorithm = algorithm.parse()?;
        let model = self
            .lifecycle
            .submit(dataset, algorithm, hyperparameters)
            .await?;
        info!(model_id = %model.id(), algorithm = %algorithm, "training submitted");
        self.pool
            .train_async(model.id(), model.hyperparameters().clone())?;
        Ok(model.id())
    }

    /// Queue an existing `PENDING` model, e.g. after a saturated submission.
    pub async fn enqueue_training(&self, model_id: ModelId) -> EngineResult<()> {
        let model = self.lifecycle.get(model_id).await?;
        if model.status() != ModelStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: model_id,
                from: model.status(),
                to: ModelStatus::Training,
            });
        }
        self.pool
            .train_async(model_id, model.hyperparameters().clone())
    }

    pub async fn model_status(&self, model_id: ModelId) -> EngineResult<ModelStatusView> {
        let model = self.lifecycle.get(model_id).await?;
        Ok(ModelStatusView::from(&model))
    }

    pub async fn model(&self, model_id: ModelId) -> EngineResult<Model> {
        self.lifecycle.get(model_id).await
    }

    pub async fn models_for_dataset(&self, dataset_id: DatasetId) -> EngineResult<Vec<Model>> {
        Ok(self.repository().list_by_dataset(dataset_id).await?)
    }

    /// Models of `dataset_id` that are still `PENDING` or `TRAINING`.
    ///
    /// A dataset collaborator checks this before deleting the dataset.
    pub async fn in_flight_models(&self, dataset_id: DatasetId) -> EngineResult<Vec<ModelId>> {
        Ok(self
            .models_for_dataset(dataset_id)
            .await?
            .iter()
            .filter(|model| !model.status().is_terminal())
            .map(Model::id)
            .collect())
    }

    pub async fn generate(
        &self,
        model_id: ModelId,
        count: u64,
        output_path: &Path,
        anomalies: Option<&AnomalySpec>,
    ) -> EngineResult<GenerationOutput> {
        self.generation
            .generate(model_id, count, output_path, anomalies)
            .await
    }

    pub async fn evaluate(&self, model_id: ModelId, sample_count: u64) -> EngineResult<String> {
        self.generation.evaluate(model_id, sample_count).await
    }

    pub async fn dataset_stats(&self, dataset: &DatasetRef) -> EngineResult<String> {
        self.stats.stats_for_dataset(dataset).await
    }

    pub fn stats_cache(&self) -> &StatsCache<T> {
        &self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.lifecycle.events().subscribe()
    }

    /// Stop accepting training and wait for queued jobs to finish.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
