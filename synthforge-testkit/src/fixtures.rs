use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use synthforge::*;

use crate::ScriptedRunner;

pub type TestEngine = Engine<InMemoryModelRepository, ScriptedRunner>;

/// Dataset `name` stored at `datasets/<name>.csv` in a fresh project.
pub fn dataset_ref(name: &str) -> DatasetRef {
    DatasetRef::new(ProjectId::new(), name, format!("datasets/{name}.csv"))
}

/// Config rooted at `storage_root` with a small pool and short shutdown.
pub fn test_config(storage_root: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_storage_root(storage_root)
        .with_training(TrainingPoolConfig {
            workers: 2,
            queue_capacity: 16,
            shutdown_timeout_secs: 5,
        })
}

/// Engine over an in-memory repository and `runner`.
pub fn build_engine(config: EngineConfig, runner: ScriptedRunner) -> anyhow::Result<TestEngine> {
    EngineBuilder::new(config)
        .with_repository(Arc::new(InMemoryModelRepository::new()))
        .with_runner(Arc::new(runner))
        .build()
}

/// Poll until the model reaches a terminal status.
pub async fn wait_for_terminal<R, T>(
    engine: &Engine<R, T>,
    model_id: ModelId,
    limit: Duration,
) -> anyhow::Result<ModelStatusView>
where
    R: ModelRepository,
    T: TaskRunner,
{
    wait_for_status(engine, model_id, limit, |status| status.is_terminal()).await
}

/// Poll until the model's status satisfies `accept`.
pub async fn wait_for_status<R, T, F>(
    engine: &Engine<R, T>,
    model_id: ModelId,
    limit: Duration,
    accept: F,
) -> anyhow::Result<ModelStatusView>
where
    R: ModelRepository,
    T: TaskRunner,
    F: Fn(ModelStatus) -> bool,
{
    let poll = async {
        loop {
            let view = engine.model_status(model_id).await?;
            if accept(view.status) {
                return Ok::<_, EngineError>(view);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    match tokio::time::timeout(limit, poll).await {
        Ok(view) => Ok(view?),
        Err(_) => {
            let status = engine.model_status(model_id).await?.status;
            anyhow::bail!("model {model_id} still {status} after {limit:?}")
        }
    }
}
