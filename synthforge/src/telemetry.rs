//! Tracing and telemetry instrumentation for synthforge.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics during model lifecycle events. All functions work both with and without
//! the `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use synthforge::telemetry::{task_span, observe_task_duration};
//!
//! let span = task_span(TaskKind::Train, Some(model_id));
//! let _enter = span.enter();
//! // ... run the task
//! observe_task_duration(TaskKind::Train, "success", started.elapsed());
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{info_span, Instrument, Span};

use crate::model::{Algorithm, ModelId};
use crate::runner::TaskKind;

/// Create a tracing span around one external task.
///
/// The span carries `task_kind` and, when the task belongs to a model,
/// `model_id`, so every forwarded output line is attributed.
#[must_use]
pub fn task_span(kind: TaskKind, model_id: Option<ModelId>) -> Span {
    match model_id {
        Some(model_id) => info_span!(
            "synthforge.task",
            task_kind = kind.as_str(),
            model_id = %model_id,
        ),
        None => info_span!(
            "synthforge.task",
            task_kind = kind.as_str(),
            model_id = tracing::field::Empty,
        ),
    }
}

/// Create a tracing span for one training job on a pool worker.
#[must_use]
pub fn training_span(worker: usize, model_id: ModelId) -> Span {
    info_span!(
        "synthforge.training",
        worker = worker,
        model_id = %model_id,
    )
}

/// Instrument a future with a training span.
pub fn instrument_training<F>(
    worker: usize,
    model_id: ModelId,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(training_span(worker, model_id))
}

/// Record a model submission.
pub fn record_model_submitted(algorithm: Algorithm) {
    tracing::info!(algorithm = algorithm.as_str(), "model submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_model_submitted(algorithm.as_str());
}

/// Record the end of a training job.
///
/// `outcome` is one of `completed`, `failed`, `abandoned`, `not_started`.
pub fn record_training_finished(model_id: ModelId, outcome: &str) {
    tracing::info!(model_id = %model_id, outcome, "training job finished");

    #[cfg(feature = "metrics")]
    crate::metrics::record_training_finished(outcome);
}

/// Observe the wall-clock duration of an external task.
pub fn observe_task_duration(kind: TaskKind, status: &str, duration: Duration) {
    let duration_secs = duration.as_secs_f64();
    tracing::debug!(
        task_kind = kind.as_str(),
        status,
        duration_secs,
        "task duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_task_duration(kind.as_str(), status, duration_secs);
}

/// Record a statistics cache lookup: `hit`, `joined` or `miss`.
pub fn record_stats_lookup(result: &str) {
    tracing::trace!(result, "stats cache lookup");

    #[cfg(feature = "metrics")]
    crate::metrics::record_stats_lookup(result);
}
