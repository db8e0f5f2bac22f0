use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Algorithm, DatasetId, ModelId, TrainingFailure};

/// Metadata envelope attached to every model event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub model_id: ModelId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(model_id: ModelId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            model_id,
            timestamp: Utc::now(),
        }
    }
}

/// Model lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEvent {
    pub meta: EventMeta,
    pub payload: ModelEventPayload,
}

impl ModelEvent {
    pub fn new(model_id: ModelId, payload: ModelEventPayload) -> Self {
        Self {
            meta: EventMeta::new(model_id),
            payload,
        }
    }

    pub fn model_id(&self) -> ModelId {
        self.meta.model_id
    }
}

/// Event payload emitted for each persisted lifecycle transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ModelEventPayload {
    /// Model was created in `PENDING`.
    Submitted {
        dataset_id: DatasetId,
        algorithm: Algorithm,
    },
    /// Model moved to `TRAINING`.
    TrainingStarted { algorithm: Algorithm },
    /// Model moved to `COMPLETED`.
    TrainingCompleted { artifact_path: PathBuf },
    /// Model moved to `FAILED`.
    TrainingFailed { failure: TrainingFailure },
}

/// Publishes model events to interested collaborators.
#[async_trait]
pub trait ModelEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: ModelEvent) -> anyhow::Result<()>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ModelEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers. A subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged` and skips
/// ahead; if no subscriber exists the event is dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<ModelEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ModelEventPublisher for InProcEventBus {
    async fn publish(&self, event: ModelEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::timeout;

    fn started(model_id: ModelId) -> ModelEvent {
        ModelEvent::new(
            model_id,
            ModelEventPayload::TrainingStarted {
                algorithm: Algorithm::Tvae,
            },
        )
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        assert!(bus.publish(started(ModelId::new())).await.is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = InProcEventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let id = ModelId::new();

        bus.publish(started(id)).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event not delivered")
                .unwrap();
            assert_eq!(event.model_id(), id);
            assert!(matches!(
                event.payload,
                ModelEventPayload::TrainingStarted { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(started(ModelId::new())).await.unwrap();
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_payload_serialises_with_type_tag() {
        let event = ModelEvent::new(
            ModelId::new(),
            ModelEventPayload::TrainingCompleted {
                artifact_path: PathBuf::from("/models/model_1.pkl"),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["type"], "training_completed");
        assert_eq!(value["payload"]["artifact_path"], "/models/model_1.pkl");
        assert_eq!(value["meta"]["version"], 1);
    }
}
