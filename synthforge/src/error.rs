use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ModelId, ModelStatus};
use crate::runner::TaskKind;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the orchestration engine.
///
/// The type is `Clone` so a single failed computation can be handed to every
/// caller waiting on it (see [`crate::stats::SingleFlight`]). Non-cloneable
/// sources are therefore held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The requested algorithm is not one of the supported identifiers.
    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),

    /// A caller-supplied argument was rejected before any work started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No model with this id exists (or it was deleted mid-job).
    #[error("model {0} not found")]
    ModelNotFound(ModelId),

    /// Generation or evaluation was requested for a model that has no artifact.
    #[error("model {id} is not trained (status {status})")]
    ModelNotTrained { id: ModelId, status: ModelStatus },

    /// A lifecycle transition that the state machine does not allow.
    #[error("illegal transition for model {id}: {from} -> {to}")]
    InvalidTransition {
        id: ModelId,
        from: ModelStatus,
        to: ModelStatus,
    },

    /// The external program could not be started.
    #[error("failed to launch {kind} task `{program}`")]
    ProcessLaunch {
        kind: TaskKind,
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The external program ran and exited unsuccessfully.
    #[error("{kind} task exited with code {exit_code}{}", last_line_suffix(.output))]
    ProcessExit {
        kind: TaskKind,
        exit_code: i32,
        output: String,
    },

    /// The external program exceeded the configured wall-clock limit.
    #[error("{kind} task timed out after {after:?}")]
    ProcessTimeout { kind: TaskKind, after: Duration },

    #[error("i/o error while {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The model repository failed.
    #[error("persistence failure: {0:#}")]
    Persistence(Arc<anyhow::Error>),

    /// The training queue is full; the model stays `PENDING`.
    #[error("training pool is saturated ({capacity} jobs queued)")]
    PoolSaturated { capacity: usize },

    /// The training pool has been shut down.
    #[error("training pool is shut down")]
    PoolClosed,

    /// The task driving a computation panicked or was cancelled.
    #[error("{kind} task aborted: {reason}")]
    TaskAborted { kind: TaskKind, reason: String },
}

impl EngineError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Exit code of a failed external process, if this error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Output captured from a failed external process, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::ProcessExit { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }

    /// True for errors raised before any external process was launched
    /// because the request itself could not be honoured.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::ModelNotTrained { .. }
                | Self::InvalidArgument(_)
                | Self::UnknownAlgorithm(_)
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(Arc::new(err))
    }
}

fn last_line_suffix(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| format!(": {line}"))
        .unwrap_or_default()
}
