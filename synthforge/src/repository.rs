use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{DatasetId, Model, ModelId, ModelStatus};

/// Storage backend for model records.
///
/// Implementations serialise writes internally; the engine never holds a
/// record across calls.
#[async_trait]
pub trait ModelRepository: Send + Sync + 'static {
    /// Persist a newly created model. Fails if the id already exists.
    async fn insert(&self, model: &Model) -> anyhow::Result<()>;

    async fn get(&self, id: ModelId) -> anyhow::Result<Option<Model>>;

    /// Overwrite an existing record, provided its stored status is still
    /// `expected`. Returns `false` when the row no longer exists or another
    /// writer moved it first; nothing is written in either case.
    async fn update(&self, model: &Model, expected: ModelStatus) -> anyhow::Result<bool>;

    /// Models trained against `dataset_id`, oldest first.
    async fn list_by_dataset(&self, dataset_id: DatasetId) -> anyhow::Result<Vec<Model>>;
}

/// Process-local repository used by default and in tests.
#[derive(Clone, Default)]
pub struct InMemoryModelRepository {
    models: Arc<RwLock<HashMap<ModelId, Model>>>,
}

impl fmt::Debug for InMemoryModelRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .models
            .try_read()
            .map(|models| models.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryModelRepository")
            .field("models", &len)
            .finish()
    }
}

impl InMemoryModelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a record, as the dataset collaborator does when a dataset is
    /// deleted.
    pub async fn remove(&self, id: ModelId) -> Option<Model> {
        self.models.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.models.read().await.is_empty()
    }
}

#[async_trait]
impl ModelRepository for InMemoryModelRepository {
    async fn insert(&self, model: &Model) -> anyhow::Result<()> {
        let mut models = self.models.write().await;
        if models.contains_key(&model.id()) {
            anyhow::bail!("model {} already exists", model.id());
        }
        models.insert(model.id(), model.clone());
        Ok(())
    }

    async fn get(&self, id: ModelId) -> anyhow::Result<Option<Model>> {
        Ok(self.models.read().await.get(&id).cloned())
    }

    async fn update(&self, model: &Model, expected: ModelStatus) -> anyhow::Result<bool> {
        let mut models = self.models.write().await;
        match models.get_mut(&model.id()) {
            Some(slot) if slot.status() == expected => {
                *slot = model.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_dataset(&self, dataset_id: DatasetId) -> anyhow::Result<Vec<Model>> {
        let models = self.models.read().await;
        let mut matching: Vec<Model> = models
            .values()
            .filter(|model| model.dataset().id == dataset_id)
            .cloned()
            .collect();
        matching.sort_by_key(|model| (model.created_at(), model.id().as_uuid()));
        Ok(matching)
    }
}
