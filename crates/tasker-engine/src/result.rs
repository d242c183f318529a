//! Execution results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasker_store::{CallDescriptor, ErrorPayload, TaskRun, TaskRunStatus};

/// Where a suspended task run is waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionData {
  /// Stack run the task is blocked on.
  pub child_stack_run_id: String,
  /// Service the blocking call targets.
  pub service_name: String,
  /// Method path of the blocking call.
  pub method_path: String,
}

impl SuspensionData {
  pub fn new(child_stack_run_id: impl Into<String>, operation: &CallDescriptor) -> Self {
    Self {
      child_stack_run_id: child_stack_run_id.into(),
      service_name: operation.service.clone(),
      method_path: operation.method.clone(),
    }
  }
}

/// Result of one `execute` or `resume` of a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionOutcome {
  Completed {
    task_run_id: String,
    output: Value,
  },
  Failed {
    task_run_id: String,
    error: Value,
  },
  Suspended {
    task_run_id: String,
    /// Always true. Kept for callers that check the flag instead of `status`.
    suspended: bool,
    suspension_data: SuspensionData,
  },
}

impl ExecutionOutcome {
  pub fn completed(task_run_id: impl Into<String>, output: Value) -> Self {
    Self::Completed {
      task_run_id: task_run_id.into(),
      output,
    }
  }

  pub fn failed(task_run_id: impl Into<String>, error: &ErrorPayload) -> Self {
    Self::Failed {
      task_run_id: task_run_id.into(),
      error: error.to_value(),
    }
  }

  pub fn suspended(task_run_id: impl Into<String>, suspension_data: SuspensionData) -> Self {
    Self::Suspended {
      task_run_id: task_run_id.into(),
      suspended: true,
      suspension_data,
    }
  }

  /// The stored result of a completed or failed task run.
  pub fn from_terminal(run: &TaskRun) -> Option<Self> {
    match run.status {
      TaskRunStatus::Completed => Some(Self::Completed {
        task_run_id: run.id.clone(),
        output: run.output.clone().unwrap_or(Value::Null),
      }),
      TaskRunStatus::Failed => Some(Self::Failed {
        task_run_id: run.id.clone(),
        error: run.error.clone().unwrap_or(Value::Null),
      }),
      _ => None,
    }
  }

  pub fn task_run_id(&self) -> &str {
    match self {
      Self::Completed { task_run_id, .. }
      | Self::Failed { task_run_id, .. }
      | Self::Suspended { task_run_id, .. } => task_run_id,
    }
  }

  pub fn status(&self) -> TaskRunStatus {
    match self {
      Self::Completed { .. } => TaskRunStatus::Completed,
      Self::Failed { .. } => TaskRunStatus::Failed,
      Self::Suspended { .. } => TaskRunStatus::SuspendedWaitingChild,
    }
  }

  pub fn output(&self) -> Option<&Value> {
    match self {
      Self::Completed { output, .. } => Some(output),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<ErrorPayload> {
    match self {
      Self::Failed { error, .. } => Some(ErrorPayload::from_value(error)),
      _ => None,
    }
  }

  pub fn suspension(&self) -> Option<&SuspensionData> {
    match self {
      Self::Suspended {
        suspension_data, ..
      } => Some(suspension_data),
      _ => None,
    }
  }
}

/// Result of running a nested task call as the body of a stack run.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedOutcome {
  Completed(Value),
  Failed(ErrorPayload),
  /// The body is waiting on a child stack run. `woken` is set when the
  /// child resolved before the parent was parked, in which case the parent
  /// is already back in `pending`.
  Suspended {
    child_stack_run_id: String,
    woken: bool,
  },
}
