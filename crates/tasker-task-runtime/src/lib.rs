//! Runtime abstraction for tasker task code.
//!
//! A [`TaskRuntime`] runs a task function's code against a [`HostCalls`]
//! handle. Runtimes are synchronous; the executor runs them on a blocking
//! thread. The [`RuntimeRegistry`] picks a runtime by the task function's
//! `runtime` metadata.

mod native;

pub use native::{NativeRuntime, NativeTask};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tasker_host::{CallError, HostCalls};
use tasker_store::{ErrorPayload, TaskFunction, error_codes};

/// Runs task code.
pub trait TaskRuntime: Send + Sync {
  /// Name used in task function metadata to select this runtime.
  fn name(&self) -> &str;

  /// Run `code` with `input` to completion. Host calls go through `host`;
  /// a call that halts surfaces as [`TaskFault::Call`] unless the code
  /// swallows it, in which case the executor still sees the halt on `host`.
  fn run(&self, code: &str, input: Value, host: HostCalls) -> Result<Value, TaskFault>;
}

/// Why task code did not return a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskFault {
  /// A host call error the code did not handle.
  #[error(transparent)]
  Call(#[from] CallError),

  /// The code raised an error of its own.
  #[error("{message}")]
  Raised {
    message: String,
    details: Option<Value>,
  },
}

impl TaskFault {
  pub fn raised(message: impl Into<String>) -> Self {
    Self::Raised {
      message: message.into(),
      details: None,
    }
  }

  /// Payload recorded on the failed task run. An unhandled failed call keeps
  /// the call's own error.
  pub fn to_payload(&self) -> ErrorPayload {
    match self {
      Self::Call(err) => err.to_payload(),
      Self::Raised { message, details } => {
        let payload = ErrorPayload::new(error_codes::EXECUTION_ERROR, message.clone());
        match details {
          Some(details) => payload.with_details(details.clone()),
          None => payload,
        }
      }
    }
  }
}

/// Errors selecting a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// No runtime is registered under this name.
  #[error("unknown runtime: {0}")]
  UnknownRuntime(String),
}

/// Available runtimes, keyed by name.
#[derive(Clone)]
pub struct RuntimeRegistry {
  runtimes: HashMap<String, Arc<dyn TaskRuntime>>,
  default_runtime: String,
}

impl RuntimeRegistry {
  /// `default_runtime` is used for task functions without `runtime` metadata.
  pub fn new(default_runtime: impl Into<String>) -> Self {
    Self {
      runtimes: HashMap::new(),
      default_runtime: default_runtime.into(),
    }
  }

  pub fn register(&mut self, runtime: Arc<dyn TaskRuntime>) {
    self.runtimes.insert(runtime.name().to_string(), runtime);
  }

  pub fn with(mut self, runtime: impl TaskRuntime + 'static) -> Self {
    self.register(Arc::new(runtime));
    self
  }

  /// Runtime for a task function.
  pub fn resolve(&self, function: &TaskFunction) -> Result<Arc<dyn TaskRuntime>, RuntimeError> {
    let name = function.runtime().unwrap_or(self.default_runtime.as_str());
    self
      .runtimes
      .get(name)
      .cloned()
      .ok_or_else(|| RuntimeError::UnknownRuntime(name.to_string()))
  }
}
