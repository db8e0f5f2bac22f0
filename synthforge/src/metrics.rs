//! Prometheus metrics instrumentation for synthforge.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `synthforge_models_submitted_total` - Models submitted for training
//! - `synthforge_training_finished_total` - Training jobs by outcome
//! - `synthforge_stats_cache_lookups_total` - Statistics cache lookups by result
//!
//! ## Histograms
//! - `synthforge_task_duration_seconds` - External task duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for synthforge metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `algorithm`: Wire name of the generator algorithm
pub static MODELS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "synthforge_models_submitted_total",
        "Total number of models submitted for training",
    );
    CounterVec::new(opts, &["algorithm"])
        .expect("synthforge_models_submitted_total metric creation failed")
});

/// Labels:
/// - `outcome`: completed, failed, abandoned, not_started
pub static TRAINING_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "synthforge_training_finished_total",
        "Total number of training jobs finished, by outcome",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("synthforge_training_finished_total metric creation failed")
});

/// Labels:
/// - `result`: hit, joined, miss
pub static STATS_CACHE_LOOKUPS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "synthforge_stats_cache_lookups_total",
        "Total number of dataset statistics lookups",
    );
    CounterVec::new(opts, &["result"])
        .expect("synthforge_stats_cache_lookups_total metric creation failed")
});

/// Labels:
/// - `task_kind`: train, generate, evaluate, stats
/// - `status`: success, failure, timeout, error
pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.05, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "synthforge_task_duration_seconds",
        "External task duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["task_kind", "status"])
        .expect("synthforge_task_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Calling it more than once is harmless.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(MODELS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TRAINING_FINISHED_TOTAL.clone()),
        Box::new(STATS_CACHE_LOOKUPS_TOTAL.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_model_submitted(algorithm: &str) {
    MODELS_SUBMITTED_TOTAL.with_label_values(&[algorithm]).inc();
}

pub fn record_training_finished(outcome: &str) {
    TRAINING_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_stats_lookup(result: &str) {
    STATS_CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn observe_task_duration(task_kind: &str, status: &str, duration_secs: f64) {
    TASK_DURATION_SECONDS
        .with_label_values(&[task_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
