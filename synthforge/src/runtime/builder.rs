use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::events::{InProcEventBus, ModelEventPublisher};
use crate::generation::GenerationOrchestrator;
use crate::lifecycle::ModelLifecycle;
use crate::repository::{InMemoryModelRepository, ModelRepository};
use crate::runner::{ProcessTaskRunner, TaskRunner};
use crate::stats::StatsCache;
use crate::storage::StorageLayout;

use super::supervisor::TrainingPool;
use super::worker::TrainingContext;

/// Builder for constructing an [`Engine`] with explicit dependencies.
///
/// The repository and runner are required. Events default to an
/// [`InProcEventBus`] sized by `event_capacity`.
///
/// # Example
///
/// ```ignore
/// use synthforge::*;
///
/// let engine = EngineBuilder::new(config)
///     .with_repository(Arc::new(repository))
///     .with_runner(Arc::new(runner))
///     .build()?;
/// ```
pub struct EngineBuilder<R: ModelRepository, T: TaskRunner> {
    config: EngineConfig,
    repository: Option<Arc<R>>,
    runner: Option<Arc<T>>,
    events: Option<Arc<dyn ModelEventPublisher>>,
}

impl<R: ModelRepository, T: TaskRunner> fmt::Debug for EngineBuilder<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EngineBuilder");
        debug.field("config", &self.config);
        debug.field("repository_set", &self.repository.is_some());
        debug.field("runner_set", &self.runner.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.repository.is_some() {
            debug.field("repository_type", &type_name::<R>());
        }
        if self.runner.is_some() {
            debug.field("runner_type", &type_name::<T>());
        }

        debug.finish()
    }
}

impl<R: ModelRepository, T: TaskRunner> EngineBuilder<R, T> {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            repository: None,
            runner: None,
            events: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<R>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_runner(mut self, runner: Arc<T>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn ModelEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the engine and start its training workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing.
    pub fn build(self) -> anyhow::Result<Engine<R, T>> {
        let repository = self
            .repository
            .ok_or_else(|| anyhow::anyhow!("repository dependency missing"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner dependency missing"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.event_capacity)));

        let storage = StorageLayout::from_config(&self.config);
        let lifecycle = ModelLifecycle::new(repository, events);
        let context = Arc::new(TrainingContext::new(
            lifecycle.clone(),
            Arc::clone(&runner),
            storage.clone(),
            self.config.output_tail_bytes,
        ));
        let pool = TrainingPool::start(self.config.training.clone(), context);
        let generation =
            GenerationOrchestrator::new(lifecycle.clone(), Arc::clone(&runner), storage.clone());
        let stats = StatsCache::new(runner, storage);

        Ok(Engine::new(self.config, lifecycle, pool, generation, stats))
    }
}

/// Convenience builder for the default stack: in-memory repository and
/// external processes launched from the configured engine directory.
pub struct StandardEngineBuilder {
    config: EngineConfig,
    events: Option<Arc<dyn ModelEventPublisher>>,
}

impl fmt::Debug for StandardEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardEngineBuilder")
            .field("config", &self.config)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl StandardEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ModelEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<Engine<InMemoryModelRepository, ProcessTaskRunner>> {
        let runner = Arc::new(ProcessTaskRunner::new(&self.config));
        let mut builder = EngineBuilder::new(self.config)
            .with_repository(Arc::new(InMemoryModelRepository::new()))
            .with_runner(runner);
        if let Some(events) = self.events {
            builder = builder.with_events(events);
        }
        builder.build()
    }
}
