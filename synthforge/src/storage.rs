use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{DatasetRef, ModelId};

/// Where datasets are read from and model artifacts are written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
    models_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            models_dir: models_dir.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.storage_root, &config.models_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_path(&self) -> PathBuf {
        self.root.join(&self.models_dir)
    }

    pub fn dataset_path(&self, dataset: &DatasetRef) -> PathBuf {
        dataset.resolve(&self.root)
    }

    /// `<root>/<models_dir>/model_<id>.pkl`
    pub fn artifact_path(&self, model_id: ModelId) -> PathBuf {
        self.models_path().join(format!("model_{model_id}.pkl"))
    }

    /// Create the models directory if it does not exist yet.
    pub async fn ensure_models_dir(&self) -> EngineResult<PathBuf> {
        let dir = self.models_path();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| EngineError::io(format!("creating {}", dir.display()), err))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProjectId;

    #[test]
    fn test_paths() {
        let layout = StorageLayout::new("/srv/storage", "models");
        let id = ModelId::new();
        assert_eq!(
            layout.artifact_path(id),
            PathBuf::from(format!("/srv/storage/models/model_{id}.pkl"))
        );

        let dataset = DatasetRef::new(ProjectId::new(), "d", "uploads/d.csv");
        assert_eq!(
            layout.dataset_path(&dataset),
            PathBuf::from("/srv/storage/uploads/d.csv")
        );

        let absolute = DatasetRef::new(ProjectId::new(), "d", "/data/d.csv");
        assert_eq!(layout.dataset_path(&absolute), PathBuf::from("/data/d.csv"));
    }

    #[tokio::test]
    async fn test_ensure_models_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path(), "nested/models");
        let dir = layout.ensure_models_dir().await.unwrap();
        assert!(dir.is_dir());
        layout.ensure_models_dir().await.unwrap();
    }
}
