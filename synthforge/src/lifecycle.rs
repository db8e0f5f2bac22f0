//! Model lifecycle state machine.
//!
//! [`ModelLifecycle`] is the only writer of model status. Each transition is
//! loaded, validated against the state machine, persisted, and then
//! announced on the event bus. [`TerminalGuard`] wraps a training job so
//! that a started model always reaches `COMPLETED` or `FAILED`.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{ModelEvent, ModelEventPayload, ModelEventPublisher};
use crate::model::{Algorithm, DatasetRef, Model, ModelId, TrainingFailure};
use crate::repository::ModelRepository;
use crate::runner::TaskKind;
use crate::telemetry;

pub struct ModelLifecycle<R: ModelRepository> {
    repository: Arc<R>,
    events: Arc<dyn ModelEventPublisher>,
}

impl<R: ModelRepository> Clone for ModelLifecycle<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            events: Arc::clone(&self.events),
        }
    }
}

impl<R: ModelRepository> fmt::Debug for ModelLifecycle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("repository", &std::any::type_name::<R>())
            .finish()
    }
}

impl<R: ModelRepository> ModelLifecycle<R> {
    pub fn new(repository: Arc<R>, events: Arc<dyn ModelEventPublisher>) -> Self {
        Self { repository, events }
    }

    pub fn repository(&self) -> Arc<R> {
        Arc::clone(&self.repository)
    }

    pub fn events(&self) -> Arc<dyn ModelEventPublisher> {
        Arc::clone(&self.events)
    }

    /// Create and persist a `PENDING` model. Nothing runs yet.
    pub async fn submit(
        &self,
        dataset: DatasetRef,
        algorithm: Algorithm,
        hyperparameters: Value,
    ) -> EngineResult<Model> {
        let dataset_id = dataset.id;
        let model = Model::new(dataset, algorithm, hyperparameters);
        self.repository
            .insert(&model)
            .await
            .with_context(|| format!("inserting model {}", model.id()))?;

        telemetry::record_model_submitted(algorithm);
        self.publish(ModelEvent::new(
            model.id(),
            ModelEventPayload::Submitted {
                dataset_id,
                algorithm,
            },
        ))
        .await;
        Ok(model)
    }

    pub async fn get(&self, id: ModelId) -> EngineResult<Model> {
        self.repository
            .get(id)
            .await
            .with_context(|| format!("loading model {id}"))?
            .ok_or(EngineError::ModelNotFound(id))
    }

    /// `PENDING -> TRAINING`, persisted before anything is launched.
    pub async fn start(&self, id: ModelId) -> EngineResult<Model> {
        let model = self.apply(id, Model::begin_training).await?;
        info!(model_id = %id, algorithm = %model.algorithm(), "training started");
        self.publish(ModelEvent::new(
            id,
            ModelEventPayload::TrainingStarted {
                algorithm: model.algorithm(),
            },
        ))
        .await;
        Ok(model)
    }

    /// `TRAINING -> COMPLETED` with the artifact location.
    pub async fn complete(&self, id: ModelId, artifact_path: PathBuf) -> EngineResult<Model> {
        let model = self
            .apply(id, |model| model.mark_completed(artifact_path.clone()))
            .await?;
        info!(model_id = %id, artifact = %artifact_path.display(), "training completed");
        self.publish(ModelEvent::new(
            id,
            ModelEventPayload::TrainingCompleted { artifact_path },
        ))
        .await;
        Ok(model)
    }

    /// `TRAINING -> FAILED`. No artifact is recorded.
    pub async fn fail(&self, id: ModelId, failure: TrainingFailure) -> EngineResult<Model> {
        let model = self
            .apply(id, |model| model.mark_failed(failure.clone()))
            .await?;
        warn!(
            model_id = %id,
            exit_code = ?failure.exit_code,
            reason = %failure.message,
            "training failed"
        );
        self.publish(ModelEvent::new(
            id,
            ModelEventPayload::TrainingFailed { failure },
        ))
        .await;
        Ok(model)
    }

    async fn apply(
        &self,
        id: ModelId,
        transition: impl FnOnce(&mut Model) -> EngineResult<()>,
    ) -> EngineResult<Model> {
        let mut model = self.get(id).await?;
        let expected = model.status();
        transition(&mut model)?;
        let updated = self
            .repository
            .update(&model, expected)
            .await
            .with_context(|| format!("updating model {id}"))?;
        if updated {
            return Ok(model);
        }

        // Lost the write: either the row is gone or another job moved it.
        match self.repository.get(id).await {
            Ok(Some(current)) => Err(EngineError::InvalidTransition {
                id,
                from: current.status(),
                to: model.status(),
            }),
            Ok(None) => Err(EngineError::ModelNotFound(id)),
            Err(err) => Err(err.context(format!("reloading model {id}")).into()),
        }
    }

    async fn publish(&self, event: ModelEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish model event");
        }
    }
}

/// How a training job ended.
#[derive(Debug, Clone)]
pub enum TrainingOutcome {
    Completed(PathBuf),
    Failed(TrainingFailure),
    /// Neither terminal state could be persisted, typically because the
    /// model was deleted while training.
    Abandoned(EngineError),
    /// The model could not be moved to `TRAINING`; nothing was launched.
    NotStarted(EngineError),
}

impl TrainingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrainingOutcome::Completed(_) => "completed",
            TrainingOutcome::Failed(_) => "failed",
            TrainingOutcome::Abandoned(_) => "abandoned",
            TrainingOutcome::NotStarted(_) => "not_started",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TrainingOutcome::Completed(_))
    }
}

/// Drives a started model to a terminal state.
///
/// The body's result, including a panic, is converted into exactly one
/// `complete` or `fail`. Nothing is propagated to the caller except the
/// returned [`TrainingOutcome`].
pub struct TerminalGuard<R: ModelRepository> {
    lifecycle: ModelLifecycle<R>,
    model_id: ModelId,
    tail_bytes: usize,
}

impl<R: ModelRepository> TerminalGuard<R> {
    pub fn new(lifecycle: ModelLifecycle<R>, model_id: ModelId, tail_bytes: usize) -> Self {
        Self {
            lifecycle,
            model_id,
            tail_bytes,
        }
    }

    pub async fn run<F>(self, body: F) -> TrainingOutcome
    where
        F: Future<Output = EngineResult<PathBuf>>,
    {
        let result = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(EngineError::TaskAborted {
                kind: TaskKind::Train,
                reason: panic_message(panic.as_ref()),
            }),
        };

        let outcome = match result {
            Ok(artifact_path) => {
                match self
                    .lifecycle
                    .complete(self.model_id, artifact_path.clone())
                    .await
                {
                    Ok(_) => TrainingOutcome::Completed(artifact_path),
                    Err(err) => {
                        error!(
                            model_id = %self.model_id,
                            error = %err,
                            "could not record completed training"
                        );
                        let failure = TrainingFailure {
                            message: format!("training finished but could not be recorded: {err}"),
                            exit_code: None,
                            output_tail: None,
                        };
                        self.record_failure(failure).await
                    }
                }
            }
            Err(err) => {
                let failure = TrainingFailure::from_error(&err, self.tail_bytes);
                self.record_failure(failure).await
            }
        };

        telemetry::record_training_finished(self.model_id, outcome.label());
        outcome
    }

    async fn record_failure(&self, failure: TrainingFailure) -> TrainingOutcome {
        match self.lifecycle.fail(self.model_id, failure.clone()).await {
            Ok(_) => TrainingOutcome::Failed(failure),
            Err(err) => {
                warn!(
                    model_id = %self.model_id,
                    error = %err,
                    reason = %failure.message,
                    "abandoning training job; terminal state not recorded"
                );
                TrainingOutcome::Abandoned(err)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::model::{ModelStatus, ProjectId};
    use crate::repository::InMemoryModelRepository;
    use serde_json::json;

    fn lifecycle() -> (ModelLifecycle<InMemoryModelRepository>, Arc<InMemoryModelRepository>) {
        let repo = Arc::new(InMemoryModelRepository::new());
        let bus: Arc<dyn ModelEventPublisher> = Arc::new(InProcEventBus::new(32));
        (ModelLifecycle::new(Arc::clone(&repo), bus), repo)
    }

    fn dataset() -> DatasetRef {
        DatasetRef::new(ProjectId::new(), "customers", "customers.csv")
    }

    #[tokio::test]
    async fn test_submit_persists_pending_model() {
        let (lifecycle, _) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({"epochs": 3}))
            .await
            .unwrap();
        let stored = lifecycle.get(model.id()).await.unwrap();
        assert_eq!(stored.status(), ModelStatus::Pending);
        assert!(stored.artifact_path().is_none());
        assert_eq!(stored.hyperparameters(), &json!({"epochs": 3}));
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_record_untouched() {
        let (lifecycle, _) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Tvae, json!({}))
            .await
            .unwrap();

        let err = lifecycle
            .complete(model.id(), PathBuf::from("/m.pkl"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let stored = lifecycle.get(model.id()).await.unwrap();
        assert_eq!(stored, model);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (lifecycle, _) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Tvae, json!({}))
            .await
            .unwrap();
        lifecycle.start(model.id()).await.unwrap();
        assert!(matches!(
            lifecycle.start(model.id()).await,
            Err(EngineError::InvalidTransition {
                from: ModelStatus::Training,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_starts_enter_training_once() {
        let (lifecycle, repo) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({}))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            lifecycle.start(model.id()),
            lifecycle.start(model.id())
        );
        let started = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(started, 1);
        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(
            loser,
            Err(EngineError::InvalidTransition {
                from: ModelStatus::Training,
                to: ModelStatus::Training,
                ..
            })
        ));
        assert_eq!(
            repo.get(model.id()).await.unwrap().unwrap().status(),
            ModelStatus::Training
        );
    }

    #[tokio::test]
    async fn test_guard_completes_on_success() {
        let (lifecycle, _) = lifecycle();
        let mut events = lifecycle.events().subscribe();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({}))
            .await
            .unwrap();
        lifecycle.start(model.id()).await.unwrap();

        let artifact = PathBuf::from("/storage/models/model.pkl");
        let outcome = TerminalGuard::new(lifecycle.clone(), model.id(), 64)
            .run(async { Ok(artifact.clone()) })
            .await;

        assert!(outcome.is_completed());
        let stored = lifecycle.get(model.id()).await.unwrap();
        assert_eq!(stored.status(), ModelStatus::Completed);
        assert_eq!(stored.artifact_path(), Some(artifact.as_path()));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.payload)
            .collect();
        assert!(matches!(kinds[0], ModelEventPayload::Submitted { .. }));
        assert!(matches!(kinds[1], ModelEventPayload::TrainingStarted { .. }));
        assert!(matches!(kinds[2], ModelEventPayload::TrainingCompleted { .. }));
    }

    #[tokio::test]
    async fn test_guard_fails_on_process_error() {
        let (lifecycle, _) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({}))
            .await
            .unwrap();
        lifecycle.start(model.id()).await.unwrap();

        let outcome = TerminalGuard::new(lifecycle.clone(), model.id(), 64)
            .run(async {
                Err(EngineError::ProcessExit {
                    kind: TaskKind::Train,
                    exit_code: 1,
                    output: "KeyError: 'age'".into(),
                })
            })
            .await;

        assert!(matches!(outcome, TrainingOutcome::Failed(_)));
        let stored = lifecycle.get(model.id()).await.unwrap();
        assert_eq!(stored.status(), ModelStatus::Failed);
        assert!(stored.artifact_path().is_none());
        let failure = stored.failure().unwrap();
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.output_tail.as_deref(), Some("KeyError: 'age'"));
    }

    #[tokio::test]
    async fn test_guard_fails_on_panic() {
        let (lifecycle, _) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({}))
            .await
            .unwrap();
        lifecycle.start(model.id()).await.unwrap();

        let outcome = TerminalGuard::new(lifecycle.clone(), model.id(), 64)
            .run(async {
                if model.id() != ModelId::new() {
                    panic!("worker exploded");
                }
                Ok(PathBuf::new())
            })
            .await;

        let TrainingOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.message.contains("worker exploded"));
        assert_eq!(
            lifecycle.get(model.id()).await.unwrap().status(),
            ModelStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_guard_abandons_deleted_model() {
        let (lifecycle, repo) = lifecycle();
        let model = lifecycle
            .submit(dataset(), Algorithm::Ctgan, json!({}))
            .await
            .unwrap();
        lifecycle.start(model.id()).await.unwrap();
        repo.remove(model.id()).await;

        let outcome = TerminalGuard::new(lifecycle.clone(), model.id(), 64)
            .run(async { Ok(PathBuf::from("/m.pkl")) })
            .await;

        assert!(matches!(
            outcome,
            TrainingOutcome::Abandoned(EngineError::ModelNotFound(_))
        ));
        assert!(repo.get(model.id()).await.unwrap().is_none());
    }
}
