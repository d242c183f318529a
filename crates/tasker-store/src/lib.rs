//! Tasker Store
//!
//! This crate provides the record store contract and its adapters. Four
//! record kinds are persisted: task runs, stack runs, task functions and
//! keystore entries.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, reading and patching task runs and stack runs
//! - Claiming runs with an expiring lease (compare-and-set)
//! - Resolving stack runs exactly once
//! - Storing task functions and keystore values
//!
//! Two adapters are provided: [`SqliteStore`] (embedded, sqlx) and
//! [`MemoryStore`] (document-shaped, in process). Both route records through
//! the [`serializer`] so structured fields and field names are handled the
//! same way.

mod memory;
pub mod serializer;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  CallDescriptor, ErrorPayload, KeystoreEntry, NewStackRun, NewTaskFunction, NewTaskRun, StackRun,
  StackRunPatch, StackRunResolution, StackRunStatus, TaskFunction, TaskRun, TaskRunPatch,
  TaskRunStatus, error_codes,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// The task run is completed or failed and can no longer change.
  #[error("task run {id} is {status} and cannot be updated")]
  TerminalState { id: String, status: TaskRunStatus },

  /// The stack run already holds its result.
  #[error("stack run {0} already has a result")]
  ResultAlreadySet(String),

  /// A record is missing required fields or holds unusable values.
  #[error("invalid record: {message}")]
  InvalidRecord { message: String },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

/// Storage contract shared by every adapter.
#[async_trait]
pub trait Store: Send + Sync {
  /// Prepare the backend (schema, connections).
  async fn init(&self) -> Result<(), Error>;

  /// Release connections.
  async fn close(&self);

  /// Create a task run in `pending`.
  async fn create_task_run(&self, new: NewTaskRun) -> Result<TaskRun, Error>;

  /// Get a task run by ID.
  async fn get_task_run(&self, id: &str) -> Result<Option<TaskRun>, Error>;

  /// Patch a task run. Fails with [`Error::TerminalState`] once the run is
  /// completed or failed.
  async fn update_task_run(&self, id: &str, patch: TaskRunPatch) -> Result<TaskRun, Error>;

  /// Atomically move a task run to `running` with a lease held by `owner`,
  /// if it is in one of `from` or is `running` with an expired lease.
  /// Returns whether the claim was won.
  async fn claim_task_run(
    &self,
    id: &str,
    from: &[TaskRunStatus],
    owner: &str,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<bool, Error>;

  /// Apply `patch` and release the lease, only if the run is still
  /// `running` under `owner`'s lease. Returns false and changes nothing
  /// once the lease has passed to someone else.
  async fn release_task_run(
    &self,
    id: &str,
    owner: &str,
    patch: TaskRunPatch,
  ) -> Result<bool, Error>;

  /// Task runs a worker should pick up again: `suspended_waiting_child`
  /// runs with no unresolved top-level stack run, and `running` runs whose
  /// lease expired before `now`.
  async fn list_resumable_task_runs(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<TaskRun>, Error>;

  /// Insert or replace the task function with this name.
  async fn store_task_function(&self, function: NewTaskFunction) -> Result<TaskFunction, Error>;

  /// Get a task function by name (task identifier).
  async fn get_task_function(&self, name: &str) -> Result<Option<TaskFunction>, Error>;

  /// Create a stack run in `pending`.
  async fn create_stack_run(&self, new: NewStackRun) -> Result<StackRun, Error>;

  /// Get a stack run by ID.
  async fn get_stack_run(&self, id: &str) -> Result<Option<StackRun>, Error>;

  /// Patch a stack run. Fails with [`Error::ResultAlreadySet`] if the patch
  /// writes a result and one is already stored.
  async fn update_stack_run(&self, id: &str, patch: StackRunPatch) -> Result<StackRun, Error>;

  /// All stack runs of a task run, ordered by call-site position.
  async fn list_stack_runs(&self, task_run_id: &str) -> Result<Vec<StackRun>, Error>;

  /// Stack runs waiting to be processed, oldest first.
  async fn list_pending_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error>;

  /// Running stack runs whose claim has expired.
  async fn list_expired_claims(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<StackRun>, Error>;

  /// Atomically claim a stack run that is `pending` (or `running` with an
  /// expired claim). Returns whether the claim was won.
  async fn claim_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    claim_expires_at: DateTime<Utc>,
  ) -> Result<bool, Error>;

  /// Store the result of a stack run claimed by `worker_id`. Returns false
  /// and changes nothing if the claim was lost or a result already exists.
  async fn resolve_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    resolution: StackRunResolution,
  ) -> Result<bool, Error>;

  /// Parked nested calls (`suspended_waiting_child`) whose children are all
  /// resolved, so nothing is left to wake them.
  async fn list_wakeable_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error>;

  /// Move a stack run from `suspended_waiting_child` back to `pending` with
  /// the given resume payload. Returns false if it was not suspended.
  async fn wake_stack_run(&self, id: &str, resume_payload: Value) -> Result<bool, Error>;

  /// Get a keystore entry.
  async fn get_keystore(&self, key: &str) -> Result<Option<KeystoreEntry>, Error>;

  /// Set a keystore entry. Last write wins.
  async fn set_keystore(
    &self,
    key: &str,
    value: Value,
    metadata: Value,
  ) -> Result<KeystoreEntry, Error>;
}
