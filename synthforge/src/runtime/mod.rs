/// Builders for constructing engine instances.
pub mod builder;
/// Training pool: bounded queue, worker tasks and graceful shutdown.
pub mod supervisor;
/// Execution of a single training job.
pub mod worker;

pub use builder::{EngineBuilder, StandardEngineBuilder};
pub use supervisor::{ShutdownToken, TrainingPool};
pub use worker::{TrainingContext, TrainingJob};
