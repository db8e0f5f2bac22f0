//! SynthForge - lifecycle orchestration for generative tabular models.
//!
//! The crate tracks models trained on stored datasets and drives the external
//! computations that train them, generate synthetic rows from them, evaluate
//! them and summarise datasets. The computations themselves run as separate
//! processes; this crate supervises them and keeps model state consistent.
//!
//! # Core Concepts
//!
//! - **Model**: A [`Model`] is one training attempt of an [`Algorithm`] against a
//!   [`DatasetRef`]. It moves `PENDING -> TRAINING -> COMPLETED | FAILED` and
//!   has an artifact path exactly when it is `COMPLETED`.
//!
//! - **Repository**: The [`ModelRepository`] trait abstracts model storage. An
//!   in-memory implementation is always available; a PostgreSQL one is behind
//!   the `postgres` feature.
//!
//! - **Runner**: The [`TaskRunner`] trait launches one external computation and
//!   collects its exit code and output. [`ProcessTaskRunner`] runs scripts with
//!   a configured interpreter.
//!
//! - **Training pool**: [`TrainingPool`] accepts submissions without blocking
//!   and trains them on a bounded set of workers. Every job that starts
//!   training ends `COMPLETED` or `FAILED`.
//!
//! - **Statistics**: [`StatsCache`] computes dataset statistics once per file,
//!   sharing in-flight computations between concurrent callers.
//!
//! - **Engine**: The [`Engine`] ties everything together and is built with
//!   [`EngineBuilder`] or [`StandardEngineBuilder`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL model repository via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use synthforge::*;
//!
//! let engine = StandardEngineBuilder::new(EngineConfig::from_env()).build()?;
//! let model_id = engine
//!     .submit_training(dataset, "CTGAN", serde_json::json!({"epochs": 50}))
//!     .await?;
//! let view = engine.model_status(model_id).await?;
//! ```

/// Configuration for the engine, its scripts and persistence.
pub mod config;

/// Facade over lifecycle, training, generation and statistics.
pub mod engine;

/// Error type shared by engine operations.
pub mod error;

/// Model lifecycle events and the in-process event bus.
pub mod events;

/// Generation and evaluation against trained models.
pub mod generation;

/// Lifecycle transitions and the terminal-state guard for training jobs.
pub mod lifecycle;

/// Model, dataset and algorithm types.
pub mod model;

/// Hyperparameter resolution from loosely typed payloads.
pub mod params;

/// Model storage backends.
pub mod repository;

/// Launching external computations and collecting their output.
pub mod runner;

/// Training pool and engine builders.
pub mod runtime;

/// Single-flight dataset statistics cache.
pub mod stats;

/// Storage layout for datasets and model artifacts.
pub mod storage;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics for submissions, training outcomes and task durations.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed model repository
/// when the `postgres` feature is enabled.
pub mod persistence;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use generation::*;
pub use lifecycle::*;
pub use model::*;
pub use params::TrainingParams;
pub use repository::*;
pub use runner::*;
pub use runtime::*;
pub use stats::*;
pub use storage::*;
