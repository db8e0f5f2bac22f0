//! Dataset statistics with single-flight memoisation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::DatasetRef;
use crate::runner::{TaskInvocation, TaskKind, TaskRunner};
use crate::storage::StorageLayout;
use crate::telemetry;

type SharedResult<V> = Shared<BoxFuture<'static, EngineResult<V>>>;

struct FlightState<V> {
    ready: HashMap<String, V>,
    in_flight: HashMap<String, (u64, SharedResult<V>)>,
}

/// Per-key memoisation where concurrent callers share one computation.
///
/// Successful values are kept until invalidated. Errors are handed to every
/// caller that was waiting on that computation but are not kept, so the
/// next call retries. Computations run on their own task and finish even if
/// every caller goes away.
pub struct SingleFlight<V> {
    kind: TaskKind,
    state: Arc<Mutex<FlightState<V>>>,
    next_generation: AtomicU64,
}

impl<V> fmt::Debug for SingleFlight<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SingleFlight")
            .field("kind", &self.kind)
            .field("ready", &state.ready.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

enum Lookup<V> {
    Ready(V),
    Wait(u64, SharedResult<V>),
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// `kind` labels aborted computations.
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(FlightState {
                ready: HashMap::new(),
                in_flight: HashMap::new(),
            })),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Cached value for `key`, or the result of the computation currently
    /// running for it, or the result of a new computation built by
    /// `compute`.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> EngineResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let lookup = {
            let mut state = self.state.lock();
            if let Some(value) = state.ready.get(key) {
                telemetry::record_stats_lookup("hit");
                Lookup::Ready(value.clone())
            } else if let Some((generation, shared)) = state.in_flight.get(key) {
                telemetry::record_stats_lookup("joined");
                Lookup::Wait(*generation, shared.clone())
            } else {
                telemetry::record_stats_lookup("miss");
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let shared = self.launch(key.to_string(), generation, compute());
                state
                    .in_flight
                    .insert(key.to_string(), (generation, shared.clone()));
                Lookup::Wait(generation, shared)
            }
        };

        match lookup {
            Lookup::Ready(value) => Ok(value),
            Lookup::Wait(generation, shared) => {
                let result = shared.await;
                if result.is_err() {
                    self.forget_flight(key, generation);
                }
                result
            }
        }
    }

    fn launch<Fut>(&self, key: String, generation: u64, computation: Fut) -> SharedResult<V>
    where
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let result = computation.await;
            let mut state = state.lock();
            let current = state.in_flight.get(&key).map(|(g, _)| *g);
            if current == Some(generation) {
                state.in_flight.remove(&key);
                if let Ok(value) = &result {
                    state.ready.insert(key, value.clone());
                }
            }
            result
        });

        let kind = self.kind;
        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(EngineError::TaskAborted {
                    kind,
                    reason: err.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the in-flight entry of a computation that died without cleaning up.
    fn forget_flight(&self, key: &str, generation: u64) {
        let mut state = self.state.lock();
        if state.in_flight.get(key).map(|(g, _)| *g) == Some(generation) {
            state.in_flight.remove(key);
        }
    }

    /// Forget the value for `key`. A computation already running for it
    /// still answers its waiters but is not cached.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let had_value = state.ready.remove(key).is_some();
        let had_flight = state.in_flight.remove(key).is_some();
        had_value || had_flight
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.ready.clear();
        state.in_flight.clear();
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// Statistics summaries of dataset files, computed once per file.
pub struct StatsCache<T: TaskRunner> {
    runner: Arc<T>,
    storage: StorageLayout,
    flights: SingleFlight<String>,
}

impl<T: TaskRunner> fmt::Debug for StatsCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsCache")
            .field("runner_type", &std::any::type_name::<T>())
            .field("storage", &self.storage)
            .field("flights", &self.flights)
            .finish()
    }
}

impl<T: TaskRunner> StatsCache<T> {
    pub fn new(runner: Arc<T>, storage: StorageLayout) -> Self {
        Self {
            runner,
            storage,
            flights: SingleFlight::new(TaskKind::Stats),
        }
    }

    /// JSON statistics for `dataset_file`, relative to the storage root.
    pub async fn stats_for(&self, dataset_file: &str) -> EngineResult<String> {
        let runner = Arc::clone(&self.runner);
        let path = self.storage.root().join(dataset_file);
        self.flights
            .get_or_compute(dataset_file, move || async move {
                let invocation = TaskInvocation::new(TaskKind::Stats).path_flag("--data", &path);
                let output = runner.run(invocation).await?;
                Ok(output.json_payload().to_string())
            })
            .await
    }

    pub async fn stats_for_dataset(&self, dataset: &DatasetRef) -> EngineResult<String> {
        self.stats_for(&dataset.file_key()).await
    }

    pub fn invalidate(&self, dataset_file: &str) -> bool {
        self.flights.invalidate(dataset_file)
    }

    pub fn clear(&self) {
        self.flights.clear()
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}
