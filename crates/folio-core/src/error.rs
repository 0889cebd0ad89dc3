//! Error types for folio-core.

use thiserror::Error;

use crate::cells::CellId;
use crate::resolve::ResolveError;

/// Result type for folio-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in folio-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Cell not found in the session.
    #[error("cell not found: {0}")]
    NotFound(CellId),

    /// Caller passed an argument that does not belong to this session.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cell earlier in the chain has not been evaluated successfully.
    #[error("cannot evaluate {cell}: prerequisite {prerequisite} is not evaluated")]
    PrerequisiteNotEvaluated { cell: CellId, prerequisite: CellId },

    /// An evaluation run is already in progress for this session.
    #[error("an evaluation is already in progress")]
    AlreadyEvaluating,

    /// Dependency resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The execution context could not load a module or one of its natives.
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// The execution context died or became unreachable.
    #[error("execution context lost: {0}")]
    ContextLost(String),

    /// IPC communication error with worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Execution was aborted by user request.
    #[error("execution aborted")]
    Aborted,
}

impl Error {
    /// Whether the error is a caller mistake reported without any state change.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::InvalidArgument(_)
                | Error::PrerequisiteNotEvaluated { .. }
                | Error::AlreadyEvaluating
        )
    }

    /// Render the error together with a recovery hint, for terminal output.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Error::PrerequisiteNotEvaluated { .. } => {
                Some("evaluate the earlier cells first, or evaluate with evaluate_all")
            }
            Error::AlreadyEvaluating => Some("wait for the current run or abort it"),
            Error::ContextLost(_) => Some("request a fresh execution context before evaluating"),
            Error::Resolve(_) => Some("check the #r reference and the package search path"),
            Error::Ipc(_) => Some("set FOLIO_WORKER_PATH or ensure folio-worker is on PATH"),
            _ => None,
        }
    }
}
