//! Engine errors.

use tasker_task_runtime::RuntimeError;

/// Errors returned by the executor, the processor and the task service.
///
/// Failures of task code are not errors here: they end up on the task run
/// as its `error` payload.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// No task run with this ID.
  #[error("task run not found: {id}")]
  TaskNotFound { id: String },

  /// No task function stored under this name.
  #[error("task function not found: {name}")]
  TaskFunctionNotFound { name: String },

  /// Another executor holds the task run's lease.
  #[error("task run {id} is locked by another executor")]
  TaskRunLocked { id: String },

  /// The task function names a runtime that is not registered.
  #[error("unknown runtime: {name}")]
  UnknownRuntime { name: String },

  /// Reading or writing records failed.
  #[error(transparent)]
  Store(#[from] tasker_store::Error),
}

impl From<RuntimeError> for EngineError {
  fn from(err: RuntimeError) -> Self {
    match err {
      RuntimeError::UnknownRuntime(name) => Self::UnknownRuntime { name },
    }
  }
}

impl EngineError {
  /// Stable code shown to callers of the submission surface.
  pub fn error_code(&self) -> &'static str {
    match self {
      Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
      Self::TaskFunctionNotFound { .. } => "TASK_FUNCTION_NOT_FOUND",
      Self::TaskRunLocked { .. } => "TASK_RUN_LOCKED",
      Self::UnknownRuntime { .. } => "UNKNOWN_RUNTIME",
      Self::Store(tasker_store::Error::InvalidRecord { .. }) => "INVALID_REQUEST",
      Self::Store(tasker_store::Error::NotFound(_)) => "NOT_FOUND",
      Self::Store(_) => "STORE_ERROR",
    }
  }

  /// Whether this is a missing-record error (a 404 for an HTTP front end).
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Self::TaskNotFound { .. }
        | Self::TaskFunctionNotFound { .. }
        | Self::Store(tasker_store::Error::NotFound(_))
    )
  }
}
