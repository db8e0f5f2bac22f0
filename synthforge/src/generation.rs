//! Synthetic data generation and model evaluation.
//!
//! Both operations run against a `COMPLETED` model and never change its
//! state. They are awaited inline by the caller; there is no queue in front
//! of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::ModelLifecycle;
use crate::model::{Model, ModelId, ModelStatus};
use crate::repository::ModelRepository;
use crate::runner::{TaskInvocation, TaskKind, TaskRunner};
use crate::storage::StorageLayout;

pub const DEFAULT_ANOMALY_RATIO: f64 = 0.05;

/// What an injected anomaly writes into a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnomalyKind {
    /// Overwrite with a constant.
    Fixed { value: Value },
    /// Blank the cell.
    Null,
}

/// Corrupt a fraction of one column's generated values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRule {
    pub column: String,
    #[serde(flatten)]
    pub kind: AnomalyKind,
    /// Fraction of rows affected, in `(0, 1]`.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

fn default_ratio() -> f64 {
    DEFAULT_ANOMALY_RATIO
}

impl AnomalyRule {
    pub fn fixed(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            kind: AnomalyKind::Fixed {
                value: value.into(),
            },
            ratio: DEFAULT_ANOMALY_RATIO,
        }
    }

    pub fn null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind: AnomalyKind::Null,
            ratio: DEFAULT_ANOMALY_RATIO,
        }
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    fn validate(&self) -> EngineResult<()> {
        if self.column.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "anomaly rule has an empty column name".into(),
            ));
        }
        if !(self.ratio.is_finite() && self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(EngineError::InvalidArgument(format!(
                "anomaly ratio for column `{}` must be in (0, 1], got {}",
                self.column, self.ratio
            )));
        }
        Ok(())
    }
}

/// Anomaly rules applied to one generation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnomalySpec(pub Vec<AnomalyRule>);

impl AnomalySpec {
    pub fn new(rules: impl IntoIterator<Item = AnomalyRule>) -> Self {
        Self(rules.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rules(&self) -> &[AnomalyRule] {
        &self.0
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.0.iter().try_for_each(AnomalyRule::validate)
    }

    /// Value of the `--anomalies` flag.
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|err| {
            EngineError::InvalidArgument(format!("unserialisable anomaly spec: {err}"))
        })
    }
}

/// Result of a successful generation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub model_id: ModelId,
    pub output_path: PathBuf,
    /// Number of rows requested from the generator.
    pub requested: u64,
}

pub struct GenerationOrchestrator<R: ModelRepository, T: TaskRunner> {
    lifecycle: ModelLifecycle<R>,
    runner: Arc<T>,
    storage: StorageLayout,
}

impl<R: ModelRepository, T: TaskRunner> fmt::Debug for GenerationOrchestrator<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("runner_type", &std::any::type_name::<T>())
            .field("storage", &self.storage)
            .finish()
    }
}

impl<R: ModelRepository, T: TaskRunner> GenerationOrchestrator<R, T> {
    pub fn new(lifecycle: ModelLifecycle<R>, runner: Arc<T>, storage: StorageLayout) -> Self {
        Self {
            lifecycle,
            runner,
            storage,
        }
    }

    /// Generate `count` synthetic rows into `output_path`.
    ///
    /// The model must be `COMPLETED`; otherwise nothing is launched.
    pub async fn generate(
        &self,
        model_id: ModelId,
        count: u64,
        output_path: &Path,
        anomalies: Option<&AnomalySpec>,
    ) -> EngineResult<GenerationOutput> {
        let (model, artifact) = self.trained_model(model_id).await?;
        if count == 0 {
            return Err(EngineError::InvalidArgument(
                "generation count must be positive".into(),
            ));
        }
        if let Some(spec) = anomalies {
            spec.validate()?;
        }

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                EngineError::io(format!("creating {}", parent.display()), err)
            })?;
        }

        let anomalies = anomalies
            .filter(|spec| !spec.is_empty())
            .map(AnomalySpec::to_json)
            .transpose()?;

        let invocation = TaskInvocation::new(TaskKind::Generate)
            .for_model(model_id)
            .path_flag("--model", &artifact)
            .flag("--count", count)
            .path_flag("--output", output_path)
            .path_flag("--original", &self.storage.dataset_path(model.dataset()))
            .flag_opt("--anomalies", anomalies);

        self.runner.run(invocation).await?;

        Ok(GenerationOutput {
            model_id,
            output_path: output_path.to_path_buf(),
            requested: count,
        })
    }

    /// Compare `sample_count` generated rows against the original dataset.
    ///
    /// Returns the JSON object printed by the evaluator, uninterpreted.
    pub async fn evaluate(&self, model_id: ModelId, sample_count: u64) -> EngineResult<String> {
        let (model, artifact) = self.trained_model(model_id).await?;
        if sample_count == 0 {
            return Err(EngineError::InvalidArgument(
                "evaluation sample count must be positive".into(),
            ));
        }

        let invocation = TaskInvocation::new(TaskKind::Evaluate)
            .for_model(model_id)
            .path_flag("--model", &artifact)
            .path_flag("--original", &self.storage.dataset_path(model.dataset()))
            .flag("--samples", sample_count);

        let output = self.runner.run(invocation).await?;
        Ok(output.json_payload().to_string())
    }

    async fn trained_model(&self, model_id: ModelId) -> EngineResult<(Model, PathBuf)> {
        let model = self.lifecycle.get(model_id).await?;
        let not_trained = EngineError::ModelNotTrained {
            id: model_id,
            status: model.status(),
        };
        if model.status() != ModelStatus::Completed {
            return Err(not_trained);
        }
        let artifact = model
            .artifact_path()
            .map(Path::to_path_buf)
            .ok_or(not_trained)?;
        Ok((model, artifact))
    }
}
