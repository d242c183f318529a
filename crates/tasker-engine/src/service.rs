//! Task service: the submission operations over one store.

use std::sync::Arc;

use serde_json::Value;
use tasker_config::Config;
use tasker_host::ServiceRegistry;
use tasker_store::{
  KeystoreEntry, NewTaskFunction, NewTaskRun, StackRun, Store, TaskFunction, TaskRun,
  TaskRunStatus,
};
use tasker_task_runtime::RuntimeRegistry;
use tracing::{info, instrument};

use crate::error::EngineError;
use crate::executor::TaskExecutor;
use crate::processor::{ProcessSummary, StackProcessor};
use crate::result::ExecutionOutcome;

/// Submit, run and inspect task runs.
///
/// # Usage
///
/// ```ignore
/// let service = TaskService::new(store, runtimes, services, &config);
/// let run = service.submit("echo", json!({"x": 1})).await?;
/// let outcome = service.execute(&run.id).await?;
/// ```
pub struct TaskService {
  store: Arc<dyn Store>,
  executor: Arc<TaskExecutor>,
  processor: StackProcessor,
}

impl TaskService {
  pub fn new(
    store: Arc<dyn Store>,
    runtimes: RuntimeRegistry,
    services: ServiceRegistry,
    config: &Config,
  ) -> Self {
    let executor = Arc::new(TaskExecutor::new(
      store.clone(),
      runtimes,
      config.executor.clone(),
    ));
    let processor = StackProcessor::new(
      store.clone(),
      executor.clone(),
      services,
      config.processor.clone(),
    );
    Self {
      store,
      executor,
      processor,
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn executor(&self) -> &TaskExecutor {
    &self.executor
  }

  pub fn processor(&self) -> &StackProcessor {
    &self.processor
  }

  /// Create a `pending` task run.
  #[instrument(name = "task_submit", skip(self, input))]
  pub async fn submit(&self, task_identifier: &str, input: Value) -> Result<TaskRun, EngineError> {
    let run = self
      .store
      .create_task_run(NewTaskRun {
        task_identifier: task_identifier.to_string(),
        input,
      })
      .await?;
    info!(task_run_id = %run.id, "task run submitted");
    Ok(run)
  }

  /// Execute a pending task run, or resume one that has been started.
  pub async fn execute(&self, id: &str) -> Result<ExecutionOutcome, EngineError> {
    let run = self.status(id).await?;
    if let Some(outcome) = ExecutionOutcome::from_terminal(&run) {
      return Ok(outcome);
    }

    let function = self
      .store
      .get_task_function(&run.task_identifier)
      .await?
      .ok_or_else(|| EngineError::TaskFunctionNotFound {
        name: run.task_identifier.clone(),
      })?;

    match run.status {
      TaskRunStatus::Pending => self.executor.execute(&run, &function).await,
      _ => self.executor.resume(&run, &run.input, &function).await,
    }
  }

  /// One stack processor pass.
  pub async fn process(&self) -> Result<ProcessSummary, EngineError> {
    self.processor.process_pending().await
  }

  /// Current task run record.
  pub async fn status(&self, id: &str) -> Result<TaskRun, EngineError> {
    self
      .store
      .get_task_run(id)
      .await?
      .ok_or_else(|| EngineError::TaskNotFound { id: id.to_string() })
  }

  /// Stack runs recorded for a task run, in call order.
  pub async fn stack_runs(&self, id: &str) -> Result<Vec<StackRun>, EngineError> {
    self.status(id).await?;
    Ok(self.store.list_stack_runs(id).await?)
  }

  pub async fn store_function(
    &self,
    function: NewTaskFunction,
  ) -> Result<TaskFunction, EngineError> {
    let stored = self.store.store_task_function(function).await?;
    info!(name = %stored.name, "task function stored");
    Ok(stored)
  }

  pub async fn get_keystore(&self, key: &str) -> Result<Option<KeystoreEntry>, EngineError> {
    Ok(self.store.get_keystore(key).await?)
  }

  pub async fn set_keystore(
    &self,
    key: &str,
    value: Value,
    metadata: Value,
  ) -> Result<KeystoreEntry, EngineError> {
    Ok(self.store.set_keystore(key, value, metadata).await?)
  }
}
