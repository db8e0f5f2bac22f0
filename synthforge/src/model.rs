use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a tracked model.
    ModelId
);
uuid_id!(
    /// Identifier of a dataset owned by the dataset collaborator.
    DatasetId
);
uuid_id!(
    /// Identifier of the project owning a dataset.
    ProjectId
);

/// Reference to a stored dataset. Owned by the dataset collaborator; the
/// engine only reads it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub id: DatasetId,
    pub project_id: ProjectId,
    /// Human-readable dataset name.
    pub name: String,
    /// Location of the dataset file, relative to the storage root unless
    /// absolute.
    pub file_path: PathBuf,
}

impl DatasetRef {
    pub fn new(
        project_id: ProjectId,
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: DatasetId::new(),
            project_id,
            name: name.into(),
            file_path: file_path.into(),
        }
    }

    /// Absolute location of the dataset file under `storage_root`.
    pub fn resolve(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(&self.file_path)
    }

    /// Identity used as the statistics cache key.
    pub fn file_key(&self) -> String {
        self.file_path.to_string_lossy().into_owned()
    }
}

/// Generator families understood by the external training computation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Conditional tabular GAN.
    #[serde(rename = "CTGAN")]
    Ctgan,
    /// Tabular variational autoencoder.
    #[serde(rename = "TVAE")]
    Tvae,
    /// Statistical Gaussian copula.
    #[serde(rename = "GaussianCopula")]
    GaussianCopula,
    /// Copula-transformed GAN.
    #[serde(rename = "CopulaGAN")]
    CopulaGan,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Ctgan,
        Algorithm::Tvae,
        Algorithm::GaussianCopula,
        Algorithm::CopulaGan,
    ];

    /// Name passed to the external computation via `--algorithm`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Ctgan => "CTGAN",
            Algorithm::Tvae => "TVAE",
            Algorithm::GaussianCopula => "GaussianCopula",
            Algorithm::CopulaGan => "CopulaGAN",
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| EngineError::UnknownAlgorithm(s.to_string()))
    }
}

/// Lifecycle state of a model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Pending,
    Training,
    Completed,
    Failed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Pending => "PENDING",
            ModelStatus::Training => "TRAINING",
            ModelStatus::Completed => "COMPLETED",
            ModelStatus::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelStatus::Completed | ModelStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (ModelStatus::Pending, ModelStatus::Training)
                | (ModelStatus::Training, ModelStatus::Completed)
                | (ModelStatus::Training, ModelStatus::Failed)
        )
    }
}

impl Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ModelStatus::Pending),
            "TRAINING" => Ok(ModelStatus::Training),
            "COMPLETED" => Ok(ModelStatus::Completed),
            "FAILED" => Ok(ModelStatus::Failed),
            other => Err(anyhow::anyhow!("invalid model status: {}", other)),
        }
    }
}

/// Diagnostics recorded when a training job fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingFailure {
    pub message: String,
    /// Exit code of the training process, when it ran to exit.
    pub exit_code: Option<i32>,
    /// Tail of the process output, when there was any.
    pub output_tail: Option<String>,
}

impl TrainingFailure {
    /// Capture the diagnostics of `err`, keeping at most `tail_bytes` of
    /// process output.
    pub fn from_error(err: &EngineError, tail_bytes: usize) -> Self {
        let output_tail = err
            .output()
            .map(|output| tail(output, tail_bytes).to_string())
            .filter(|output| !output.trim().is_empty());
        Self {
            message: err.to_string(),
            exit_code: err.exit_code(),
            output_tail,
        }
    }
}

/// Last `max_bytes` of `text`, cut on a character boundary.
pub(crate) fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// One trained-generator attempt against one dataset.
///
/// `status`, `artifact_path` and `failure` only change through the
/// transition methods, which keep `artifact_path.is_some()` equivalent to
/// `status == Completed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ModelRecord", into = "ModelRecord")]
pub struct Model {
    id: ModelId,
    dataset: DatasetRef,
    algorithm: Algorithm,
    status: ModelStatus,
    artifact_path: Option<PathBuf>,
    hyperparameters: serde_json::Value,
    failure: Option<TrainingFailure>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Model {
    /// Create a `PENDING` model with no artifact.
    pub fn new(
        dataset: DatasetRef,
        algorithm: Algorithm,
        hyperparameters: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ModelId::new(),
            dataset,
            algorithm,
            status: ModelStatus::Pending,
            artifact_path: None,
            hyperparameters,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn dataset(&self) -> &DatasetRef {
        &self.dataset
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    /// Payload captured at submission; never rewritten.
    pub fn hyperparameters(&self) -> &serde_json::Value {
        &self.hyperparameters
    }

    pub fn failure(&self) -> Option<&TrainingFailure> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// `PENDING -> TRAINING`.
    pub fn begin_training(&mut self) -> EngineResult<()> {
        self.transition(ModelStatus::Training)
    }

    /// `TRAINING -> COMPLETED`, recording where the artifact was written.
    pub fn mark_completed(&mut self, artifact_path: PathBuf) -> EngineResult<()> {
        self.transition(ModelStatus::Completed)?;
        self.artifact_path = Some(artifact_path);
        Ok(())
    }

    /// `TRAINING -> FAILED`. The artifact path stays unset.
    pub fn mark_failed(&mut self, failure: TrainingFailure) -> EngineResult<()> {
        self.transition(ModelStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    fn transition(&mut self, next: ModelStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Flat, unvalidated form of a [`Model`] used by persistence backends and
/// serde. Converting back into a `Model` re-checks the lifecycle invariants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: ModelId,
    pub dataset: DatasetRef,
    pub algorithm: Algorithm,
    pub status: ModelStatus,
    pub artifact_path: Option<PathBuf>,
    pub hyperparameters: serde_json::Value,
    pub failure: Option<TrainingFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ModelRecord> for Model {
    type Error = anyhow::Error;

    fn try_from(record: ModelRecord) -> Result<Self, Self::Error> {
        let completed = record.status == ModelStatus::Completed;
        if completed != record.artifact_path.is_some() {
            anyhow::bail!(
                "model {} has status {} but artifact path {:?}",
                record.id,
                record.status,
                record.artifact_path
            );
        }
        if record.failure.is_some() && record.status != ModelStatus::Failed {
            anyhow::bail!(
                "model {} has failure diagnostics but status {}",
                record.id,
                record.status
            );
        }
        Ok(Model {
            id: record.id,
            dataset: record.dataset,
            algorithm: record.algorithm,
            status: record.status,
            artifact_path: record.artifact_path,
            hyperparameters: record.hyperparameters,
            failure: record.failure,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl From<Model> for ModelRecord {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            dataset: model.dataset,
            algorithm: model.algorithm,
            status: model.status,
            artifact_path: model.artifact_path,
            hyperparameters: model.hyperparameters,
            failure: model.failure,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dataset() -> DatasetRef {
        DatasetRef::new(ProjectId::new(), "customers", "uploads/customers.csv")
    }

    fn assert_artifact_invariant(model: &Model) {
        assert_eq!(
            model.artifact_path().is_some(),
            model.status() == ModelStatus::Completed,
            "artifact path must be set iff COMPLETED (status {})",
            model.status()
        );
    }

    #[test]
    fn test_algorithm_parses_case_insensitively() {
        assert_eq!("TVAE".parse::<Algorithm>().unwrap(), Algorithm::Tvae);
        assert_eq!("ctgan".parse::<Algorithm>().unwrap(), Algorithm::Ctgan);
        assert_eq!(
            " copulagan ".parse::<Algorithm>().unwrap(),
            Algorithm::CopulaGan
        );
        let err = "diffusion".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, EngineError::UnknownAlgorithm(name) if name == "diffusion"));
    }

    #[test]
    fn test_algorithm_serde_uses_wire_names() {
        let value = serde_json::to_value(Algorithm::GaussianCopula).unwrap();
        assert_eq!(value, json!("GaussianCopula"));
    }

    #[test]
    fn test_happy_path_transitions_keep_invariant() {
        let mut model = Model::new(dataset(), Algorithm::Ctgan, json!({}));
        assert_eq!(model.status(), ModelStatus::Pending);
        assert_artifact_invariant(&model);

        model.begin_training().unwrap();
        assert_eq!(model.status(), ModelStatus::Training);
        assert_artifact_invariant(&model);

        model
            .mark_completed(PathBuf::from("/models/model_1.pkl"))
            .unwrap();
        assert_eq!(model.status(), ModelStatus::Completed);
        assert_eq!(
            model.artifact_path(),
            Some(Path::new("/models/model_1.pkl"))
        );
        assert_artifact_invariant(&model);
    }

    #[test]
    fn test_pending_cannot_jump_to_terminal_states() {
        let mut model = Model::new(dataset(), Algorithm::Tvae, json!({}));

        let err = model
            .mark_completed(PathBuf::from("/models/x.pkl"))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: ModelStatus::Pending,
                to: ModelStatus::Completed,
                ..
            }
        ));

        let failure = TrainingFailure {
            message: "boom".into(),
            exit_code: None,
            output_tail: None,
        };
        assert!(model.mark_failed(failure).is_err());
        assert_eq!(model.status(), ModelStatus::Pending);
        assert_artifact_invariant(&model);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut model = Model::new(dataset(), Algorithm::Tvae, json!({}));
        model.begin_training().unwrap();
        model
            .mark_failed(TrainingFailure {
                message: "exit 1".into(),
                exit_code: Some(1),
                output_tail: None,
            })
            .unwrap();
        assert_artifact_invariant(&model);

        assert!(model.begin_training().is_err());
        assert!(model.mark_completed(PathBuf::from("/x")).is_err());
        assert_eq!(model.status(), ModelStatus::Failed);
        assert_eq!(model.failure().unwrap().exit_code, Some(1));
    }

    #[test]
    fn test_training_entered_only_once() {
        let mut model = Model::new(dataset(), Algorithm::Tvae, json!({}));
        model.begin_training().unwrap();
        assert!(model.begin_training().is_err());
    }

    #[test]
    fn test_record_round_trip_rejects_broken_invariant() {
        let model = Model::new(dataset(), Algorithm::Ctgan, json!({"epochs": 3}));
        let mut record = ModelRecord::from(model.clone());
        assert_eq!(Model::try_from(record.clone()).unwrap(), model);

        record.artifact_path = Some(PathBuf::from("/models/stale.pkl"));
        assert!(Model::try_from(record).is_err());
    }

    #[test]
    fn test_failure_from_process_error_keeps_tail() {
        let err = EngineError::ProcessExit {
            kind: crate::runner::TaskKind::Train,
            exit_code: 1,
            output: "a".repeat(100) + "\nTraceback: boom",
        };
        let failure = TrainingFailure::from_error(&err, 15);
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.output_tail.as_deref(), Some("Traceback: boom"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "ééé";
        assert_eq!(tail(text, 3), "é");
        assert_eq!(tail(text, 10), text);
    }

    #[test]
    fn test_dataset_resolution() {
        let dataset = dataset();
        assert_eq!(
            dataset.resolve(Path::new("/srv/storage")),
            PathBuf::from("/srv/storage/uploads/customers.csv")
        );
        assert_eq!(dataset.file_key(), "uploads/customers.csv");
    }
}
