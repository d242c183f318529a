use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Stable error codes stored in `error` payloads.
pub mod error_codes {
  /// Task code raised an error that it did not recover from.
  pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
  /// An external call failed.
  pub const STACK_CALL_ERROR: &str = "STACK_CALL_ERROR";
  /// An external call exceeded its time budget.
  pub const CALL_TIMEOUT: &str = "CALL_TIMEOUT";
  /// No handler is registered for the call's service name.
  pub const UNKNOWN_SERVICE: &str = "UNKNOWN_SERVICE";
  /// A replay issued a different call than the one memoized at that position.
  pub const NON_DETERMINISTIC_REPLAY: &str = "NON_DETERMINISTIC_REPLAY";
  /// A nested task call named a task function that does not exist.
  pub const TASK_FUNCTION_NOT_FOUND: &str = "TASK_FUNCTION_NOT_FOUND";
}

/// Status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
  Pending,
  Running,
  SuspendedWaitingChild,
  Completed,
  Failed,
}

impl TaskRunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::SuspendedWaitingChild => "suspended_waiting_child",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  /// Completed and failed runs never change again.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

impl fmt::Display for TaskRunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskRunStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "running" => Ok(Self::Running),
      "suspended_waiting_child" => Ok(Self::SuspendedWaitingChild),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(Error::InvalidRecord {
        message: format!("unknown task run status: {}", other),
      }),
    }
  }
}

/// Status of a stack run.
///
/// `SuspendedWaitingChild` is only reached by nested task calls, whose body
/// issues host calls of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackRunStatus {
  Pending,
  Running,
  SuspendedWaitingChild,
  Completed,
  Failed,
}

impl StackRunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::SuspendedWaitingChild => "suspended_waiting_child",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  pub fn is_resolved(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

impl fmt::Display for StackRunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StackRunStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "running" => Ok(Self::Running),
      "suspended_waiting_child" => Ok(Self::SuspendedWaitingChild),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(Error::InvalidRecord {
        message: format!("unknown stack run status: {}", other),
      }),
    }
  }
}

/// Structured error stored on failed task runs and stack runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
  pub code: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub details: Option<Value>,
}

impl ErrorPayload {
  pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      message: message.into(),
      details: None,
    }
  }

  pub fn with_details(mut self, details: Value) -> Self {
    self.details = Some(details);
    self
  }

  pub fn to_value(&self) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("code".to_string(), Value::String(self.code.clone()));
    map.insert("message".to_string(), Value::String(self.message.clone()));
    if let Some(details) = &self.details {
      map.insert("details".to_string(), details.clone());
    }
    Value::Object(map)
  }

  /// Read a stored error back. Values that are not a well-formed payload
  /// (legacy rows, bare strings) become an `EXECUTION_ERROR` carrying
  /// their text.
  pub fn from_value(value: &Value) -> Self {
    if let Ok(payload) = serde_json::from_value::<ErrorPayload>(value.clone()) {
      return payload;
    }
    match value {
      Value::String(s) => Self::new(error_codes::EXECUTION_ERROR, s.clone()),
      Value::Object(map) => {
        let message = map
          .get("message")
          .and_then(Value::as_str)
          .map(str::to_string)
          .unwrap_or_else(|| value.to_string());
        Self::new(error_codes::EXECUTION_ERROR, message).with_details(value.clone())
      }
      other => Self::new(error_codes::EXECUTION_ERROR, other.to_string()),
    }
  }
}

impl fmt::Display for ErrorPayload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.code, self.message)
  }
}

/// What a stack run asks the processor to do: call `method` on `service`
/// with `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
  /// Target service name, e.g. `http`, `keystore`, `task`.
  pub service: String,
  /// Method path within the service, e.g. `get` or `admin.domains.list`.
  pub method: String,
  /// Positional arguments.
  #[serde(default)]
  pub args: Vec<Value>,
}

impl CallDescriptor {
  pub fn new(service: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
    Self {
      service: service.into(),
      method: method.into(),
      args,
    }
  }
}

impl fmt::Display for CallDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.service, self.method)
  }
}

/// One logical invocation of a named task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
  pub id: String,
  /// Name of the task function to run.
  pub task_identifier: String,
  pub status: TaskRunStatus,
  /// Set once at creation.
  pub input: Value,
  pub output: Option<Value>,
  pub error: Option<Value>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Execution lease held by whoever is currently advancing this run.
  pub locked_until: Option<DateTime<Utc>>,
  /// Token of the lease holder. Final writes are accepted only from it.
  pub locked_by: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl TaskRun {
  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }
}

/// One host call made by task code, or by the body of a nested call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRun {
  pub id: String,
  pub task_run_id: String,
  /// Enclosing stack run for calls issued inside a nested task call.
  pub parent_stack_run_id: Option<String>,
  /// Call-site position within its scope (`task_run_id`, `parent_stack_run_id`).
  pub call_index: u32,
  pub operation: CallDescriptor,
  pub status: StackRunStatus,
  pub input: Value,
  pub output: Option<Value>,
  pub error: Option<Value>,
  pub resume_payload: Option<Value>,
  pub claimed_by: Option<String>,
  pub claim_expires_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl StackRun {
  pub fn is_resolved(&self) -> bool {
    self.status.is_resolved()
  }

  /// The memoized result, once resolved.
  pub fn resolution(&self) -> Option<StackRunResolution> {
    match self.status {
      StackRunStatus::Completed => Some(StackRunResolution::Completed(
        self.output.clone().unwrap_or(Value::Null),
      )),
      StackRunStatus::Failed => Some(StackRunResolution::Failed(
        self.error.clone().unwrap_or_else(|| {
          ErrorPayload::new(error_codes::STACK_CALL_ERROR, "call failed").to_value()
        }),
      )),
      _ => None,
    }
  }
}

/// Stored code and metadata for a named task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFunction {
  pub id: String,
  pub name: String,
  pub code: String,
  pub metadata: Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl TaskFunction {
  /// Runtime requested in metadata (`{"runtime": "lua"}`), if any.
  pub fn runtime(&self) -> Option<&str> {
    self.metadata.get("runtime").and_then(Value::as_str)
  }
}

/// Credential or opaque value consulted by host calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreEntry {
  pub key: String,
  pub value: Value,
  pub metadata: Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Fields for a new task run. It starts `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskRun {
  pub task_identifier: String,
  pub input: Value,
}

impl NewTaskRun {
  pub fn validate(&self) -> Result<(), Error> {
    if self.task_identifier.trim().is_empty() {
      return Err(Error::InvalidRecord {
        message: "task_identifier is required".to_string(),
      });
    }
    Ok(())
  }
}

/// Fields for a new stack run. It starts `pending`, with the call's
/// arguments as its input.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStackRun {
  pub task_run_id: String,
  pub parent_stack_run_id: Option<String>,
  pub call_index: u32,
  pub operation: CallDescriptor,
}

/// Fields for storing (or replacing) a task function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskFunction {
  pub name: String,
  pub code: String,
  #[serde(default)]
  pub metadata: Value,
}

impl NewTaskFunction {
  pub fn validate(&self) -> Result<(), Error> {
    if self.name.trim().is_empty() {
      return Err(Error::InvalidRecord {
        message: "task function name is required".to_string(),
      });
    }
    if self.code.trim().is_empty() {
      return Err(Error::InvalidRecord {
        message: format!("code is required for task function '{}'", self.name),
      });
    }
    Ok(())
  }
}

/// Partial update of a task run. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRunPatch {
  pub status: Option<TaskRunStatus>,
  pub output: Option<Value>,
  pub error: Option<Value>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  /// `Some(None)` releases the lease.
  pub locked_until: Option<Option<DateTime<Utc>>>,
  /// `Some(None)` clears the lease holder.
  pub locked_by: Option<Option<String>>,
}

impl TaskRunPatch {
  pub fn apply(&self, run: &mut TaskRun, now: DateTime<Utc>) {
    if let Some(status) = self.status {
      run.status = status;
    }
    if let Some(output) = &self.output {
      run.output = Some(output.clone());
    }
    if let Some(error) = &self.error {
      run.error = Some(error.clone());
    }
    if let Some(started_at) = self.started_at {
      run.started_at = Some(started_at);
    }
    if let Some(completed_at) = self.completed_at {
      run.completed_at = Some(completed_at);
    }
    if let Some(locked_until) = self.locked_until {
      run.locked_until = locked_until;
    }
    if let Some(locked_by) = &self.locked_by {
      run.locked_by = locked_by.clone();
    }
    run.updated_at = now;
  }
}

/// Partial update of a stack run. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackRunPatch {
  pub status: Option<StackRunStatus>,
  pub output: Option<Value>,
  pub error: Option<Value>,
  pub resume_payload: Option<Value>,
  /// `Some(None)` clears the claim owner.
  pub claimed_by: Option<Option<String>>,
  /// `Some(None)` clears the claim expiry.
  pub claim_expires_at: Option<Option<DateTime<Utc>>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl StackRunPatch {
  /// Whether this patch writes a result.
  pub fn sets_result(&self) -> bool {
    self.output.is_some() || self.error.is_some()
  }

  pub fn apply(&self, run: &mut StackRun, now: DateTime<Utc>) {
    if let Some(status) = self.status {
      run.status = status;
    }
    if let Some(output) = &self.output {
      run.output = Some(output.clone());
    }
    if let Some(error) = &self.error {
      run.error = Some(error.clone());
    }
    if let Some(resume_payload) = &self.resume_payload {
      run.resume_payload = Some(resume_payload.clone());
    }
    if let Some(claimed_by) = &self.claimed_by {
      run.claimed_by = claimed_by.clone();
    }
    if let Some(claim_expires_at) = self.claim_expires_at {
      run.claim_expires_at = claim_expires_at;
    }
    if let Some(completed_at) = self.completed_at {
      run.completed_at = Some(completed_at);
    }
    run.updated_at = now;
  }
}

/// Final result of an external call.
#[derive(Debug, Clone, PartialEq)]
pub enum StackRunResolution {
  Completed(Value),
  /// Carries the stored error payload.
  Failed(Value),
}

impl StackRunResolution {
  pub fn status(&self) -> StackRunStatus {
    match self {
      Self::Completed(_) => StackRunStatus::Completed,
      Self::Failed(_) => StackRunStatus::Failed,
    }
  }

  pub fn output(&self) -> Option<&Value> {
    match self {
      Self::Completed(v) => Some(v),
      Self::Failed(_) => None,
    }
  }

  pub fn error(&self) -> Option<&Value> {
    match self {
      Self::Completed(_) => None,
      Self::Failed(e) => Some(e),
    }
  }
}
