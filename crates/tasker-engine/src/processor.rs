//! Stack processor.
//!
//! Performs the external calls recorded as stack runs and unblocks the task
//! runs waiting on them. Several processors may share one store; claims on
//! individual stack runs keep each call to a single worker.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tasker_config::ProcessorConfig;
use tasker_host::{CallContext, ServiceRegistry, TASK_SERVICE};
use tasker_store::serializer::now;
use tasker_store::{
  ErrorPayload, StackRun, StackRunResolution, StackRunStatus, Store, TaskRun, TaskRunStatus,
  error_codes,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::executor::{TaskExecutor, deadline};
use crate::result::{ExecutionOutcome, NestedOutcome};

/// What one `process_pending` pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
  /// Stack runs this worker claimed.
  pub claimed: usize,
  /// Stack runs resolved as completed.
  pub completed: usize,
  /// Stack runs resolved as failed.
  pub failed: usize,
  /// Nested task calls parked waiting on a child.
  pub suspended: usize,
  /// Parked nested calls moved back to `pending` after a child resolved.
  pub woken: usize,
  /// Stack runs left alone because another worker holds or resolved them.
  pub skipped: usize,
  /// Task runs resumed in this pass and how each attempt ended.
  pub resumed: Vec<ExecutionOutcome>,
}

/// Resolves pending stack runs.
pub struct StackProcessor {
  store: Arc<dyn Store>,
  executor: Arc<TaskExecutor>,
  services: ServiceRegistry,
  config: ProcessorConfig,
  worker_id: String,
}

impl StackProcessor {
  pub fn new(
    store: Arc<dyn Store>,
    executor: Arc<TaskExecutor>,
    services: ServiceRegistry,
    config: ProcessorConfig,
  ) -> Self {
    let worker_id = config.worker_id();
    Self {
      store,
      executor,
      services,
      config,
      worker_id,
    }
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  /// One pass over pending stack runs and expired claims.
  ///
  /// The pass first picks up work a crashed worker left behind: parked
  /// nested calls whose children are all resolved, and task runs that are
  /// ready to resume or whose lease expired.
  ///
  /// Store errors abort the pass. Failed calls do not: they are recorded on
  /// their stack run.
  #[instrument(name = "process_pending", skip(self), fields(worker_id = %self.worker_id))]
  pub async fn process_pending(&self) -> Result<ProcessSummary, EngineError> {
    let limit = self.config.batch_size;
    let mut summary = ProcessSummary::default();
    self.recover(&mut summary).await?;

    let mut queue: VecDeque<StackRun> = VecDeque::new();
    let mut queued = HashSet::new();

    let pending = self.store.list_pending_stack_runs(limit).await?;
    let expired = self.store.list_expired_claims(now(), limit).await?;
    for run in pending.into_iter().chain(expired) {
      if queued.insert(run.id.clone()) {
        queue.push_back(run);
      }
    }

    while let Some(run) = queue.pop_front() {
      self.process_one(run, &mut queue, &mut summary).await?;
    }

    debug!(
      claimed = summary.claimed,
      completed = summary.completed,
      failed = summary.failed,
      skipped = summary.skipped,
      woken = summary.woken,
      resumed = summary.resumed.len(),
      "pass finished"
    );
    Ok(summary)
  }

  /// Run passes every `interval` until `cancel` fires. Errors are logged
  /// and the next pass runs anyway.
  pub async fn run_until_cancelled(&self, interval: Duration, cancel: CancellationToken) {
    info!(worker_id = %self.worker_id, "starting stack processor");

    loop {
      match self.process_pending().await {
        Ok(summary) if summary.claimed > 0 || !summary.resumed.is_empty() => {
          info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            woken = summary.woken,
            resumed = summary.resumed.len(),
            "processed stack runs"
          );
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "stack processor pass failed"),
      }

      tokio::select! {
        _ = cancel.cancelled() => {
          info!(worker_id = %self.worker_id, "stack processor cancelled");
          break;
        }
        _ = tokio::time::sleep(interval) => {}
      }
    }
  }

  async fn recover(&self, summary: &mut ProcessSummary) -> Result<(), EngineError> {
    let limit = self.config.batch_size;

    for parent in self.store.list_wakeable_stack_runs(limit).await? {
      let children = self.store.list_stack_runs(&parent.task_run_id).await?;
      let Some(child) = children
        .iter()
        .filter(|run| run.parent_stack_run_id.as_deref() == Some(parent.id.as_str()))
        .max_by_key(|run| run.call_index)
      else {
        continue;
      };
      if self.wake(&parent.id, &child.id, child.status).await? {
        summary.woken += 1;
        info!(stack_run_id = %parent.id, child_stack_run_id = %child.id, "stack_run_recovered");
      }
    }

    for task_run in self.store.list_resumable_task_runs(now(), limit).await? {
      info!(task_run_id = %task_run.id, status = %task_run.status, "task_run_recovered");
      self.resume(task_run, summary).await?;
    }
    Ok(())
  }

  /// Move a parked parent back to `pending`, recording which child woke it.
  async fn wake(
    &self,
    parent_id: &str,
    child_id: &str,
    status: StackRunStatus,
  ) -> Result<bool, EngineError> {
    let payload = json!({
      "childStackRunId": child_id,
      "status": status.as_str(),
    });
    Ok(self.store.wake_stack_run(parent_id, payload).await?)
  }

  async fn process_one(
    &self,
    run: StackRun,
    queue: &mut VecDeque<StackRun>,
    summary: &mut ProcessSummary,
  ) -> Result<(), EngineError> {
    let claimed_at = now();
    let expires = deadline(claimed_at, self.config.lock_timeout_ms);
    if !self
      .store
      .claim_stack_run(&run.id, &self.worker_id, claimed_at, expires)
      .await?
    {
      debug!(stack_run_id = %run.id, "stack_run_skipped");
      summary.skipped += 1;
      return Ok(());
    }
    summary.claimed += 1;
    info!(
      stack_run_id = %run.id,
      task_run_id = %run.task_run_id,
      call = %run.operation,
      "stack_run_claimed"
    );

    let resolution = if run.operation.service == TASK_SERVICE {
      match self.run_nested(&run).await? {
        Some(resolution) => resolution,
        None => {
          summary.suspended += 1;
          if let Some(parent) = self.woken(&run.id).await? {
            queue.push_back(parent);
          }
          return Ok(());
        }
      }
    } else {
      self.perform_call(&run).await
    };

    if !self
      .store
      .resolve_stack_run(&run.id, &self.worker_id, resolution.clone())
      .await?
    {
      warn!(stack_run_id = %run.id, reason = "claim lost", "stack_run_skipped");
      summary.skipped += 1;
      return Ok(());
    }

    match &resolution {
      StackRunResolution::Completed(_) => {
        summary.completed += 1;
        info!(stack_run_id = %run.id, "stack_run_completed");
      }
      StackRunResolution::Failed(error) => {
        summary.failed += 1;
        warn!(stack_run_id = %run.id, error = %error, "stack_run_failed");
      }
    }

    match &run.parent_stack_run_id {
      Some(parent_id) => {
        if self.wake(parent_id, &run.id, resolution.status()).await? {
          summary.woken += 1;
          if let Some(parent) = self.store.get_stack_run(parent_id).await? {
            debug!(stack_run_id = %parent.id, "parent stack run woken");
            queue.push_back(parent);
          }
        }
      }
      None => self.resume_task_run(&run.task_run_id, summary).await?,
    }

    Ok(())
  }

  /// A parked nested call that is already back in `pending`.
  async fn woken(&self, id: &str) -> Result<Option<StackRun>, EngineError> {
    Ok(
      self
        .store
        .get_stack_run(id)
        .await?
        .filter(|run| run.status == StackRunStatus::Pending),
    )
  }

  /// Run the body of a nested task call. `None` means the body is waiting
  /// on a child of its own.
  async fn run_nested(&self, run: &StackRun) -> Result<Option<StackRunResolution>, EngineError> {
    let name = &run.operation.method;
    let Some(function) = self.store.get_task_function(name).await? else {
      let error = ErrorPayload::new(
        error_codes::TASK_FUNCTION_NOT_FOUND,
        format!("task function not found: {}", name),
      );
      return Ok(Some(StackRunResolution::Failed(error.to_value())));
    };
    let input = run.operation.args.first().cloned().unwrap_or(Value::Null);
    let call_timeout = Duration::from_millis(self.config.call_timeout_ms);

    match self
      .executor
      .run_nested(run, input, &function, call_timeout)
      .await
    {
      Ok(NestedOutcome::Completed(output)) => Ok(Some(StackRunResolution::Completed(output))),
      Ok(NestedOutcome::Failed(error)) => Ok(Some(StackRunResolution::Failed(error.to_value()))),
      Ok(NestedOutcome::Suspended { .. }) => Ok(None),
      Err(EngineError::UnknownRuntime { name }) => {
        let error = ErrorPayload::new(
          error_codes::EXECUTION_ERROR,
          format!("unknown runtime: {}", name),
        );
        Ok(Some(StackRunResolution::Failed(error.to_value())))
      }
      Err(e) => Err(e),
    }
  }

  /// Dispatch an external call to its service handler.
  async fn perform_call(&self, run: &StackRun) -> StackRunResolution {
    let op = &run.operation;
    let Some(handler) = self.services.get(&op.service) else {
      let error = ErrorPayload::new(
        error_codes::UNKNOWN_SERVICE,
        format!("no service registered for '{}'", op.service),
      );
      return StackRunResolution::Failed(error.to_value());
    };

    let ctx = CallContext {
      task_run_id: run.task_run_id.clone(),
      stack_run_id: run.id.clone(),
      store: self.store.clone(),
    };
    let timeout = Duration::from_millis(self.config.call_timeout_ms);

    match tokio::time::timeout(timeout, handler.call(&ctx, &op.method, &op.args)).await {
      Ok(Ok(output)) => StackRunResolution::Completed(output),
      Ok(Err(e)) => StackRunResolution::Failed(e.to_payload().to_value()),
      Err(_) => {
        let error = ErrorPayload::new(
          error_codes::CALL_TIMEOUT,
          format!("{} timed out after {}ms", op, self.config.call_timeout_ms),
        );
        StackRunResolution::Failed(error.to_value())
      }
    }
  }

  /// Resume a task run once none of its top-level calls is outstanding.
  async fn resume_task_run(
    &self,
    task_run_id: &str,
    summary: &mut ProcessSummary,
  ) -> Result<(), EngineError> {
    let runs = self.store.list_stack_runs(task_run_id).await?;
    let outstanding = runs
      .iter()
      .filter(|run| run.parent_stack_run_id.is_none() && !run.is_resolved())
      .count();
    if outstanding > 0 {
      debug!(task_run_id, outstanding, "task run still waiting on calls");
      return Ok(());
    }

    let Some(task_run) = self.store.get_task_run(task_run_id).await? else {
      warn!(task_run_id, "task run for resolved stack run is missing");
      return Ok(());
    };
    if task_run.status != TaskRunStatus::SuspendedWaitingChild {
      debug!(task_run_id, status = %task_run.status, reason = "not suspended", "task_resume_skipped");
      return Ok(());
    }
    self.resume(task_run, summary).await
  }

  /// Replay a task run. Runs that cannot be resumed right now are logged
  /// and left for a later pass.
  async fn resume(&self, task_run: TaskRun, summary: &mut ProcessSummary) -> Result<(), EngineError> {
    let task_run_id = task_run.id.as_str();
    let Some(function) = self
      .store
      .get_task_function(&task_run.task_identifier)
      .await?
    else {
      warn!(
        task_run_id,
        task = %task_run.task_identifier,
        reason = "task function not found",
        "task_resume_skipped"
      );
      return Ok(());
    };

    match self
      .executor
      .resume(&task_run, &task_run.input, &function)
      .await
    {
      Ok(outcome) => {
        summary.resumed.push(outcome);
        Ok(())
      }
      Err(EngineError::TaskRunLocked { .. }) => {
        info!(task_run_id, reason = "locked", "task_resume_skipped");
        Ok(())
      }
      Err(EngineError::UnknownRuntime { name }) => {
        warn!(task_run_id, runtime = %name, reason = "unknown runtime", "task_resume_skipped");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }
}
