//! Task executor implementation.
//!
//! Every attempt runs the task code from the top against an interceptor
//! seeded with the task run's recorded stack runs. Calls with a recorded
//! result return it; the first call without one halts the attempt and the
//! run is parked as `suspended_waiting_child` until the processor resolves
//! that call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tasker_config::ExecutorConfig;
use tasker_host::{CallError, Halt, HostCalls, Interceptor, Suspension};
use tasker_store::serializer::now;
use tasker_store::{
  ErrorPayload, NewStackRun, StackRun, StackRunPatch, StackRunStatus, Store, TaskFunction,
  TaskRun, TaskRunPatch, TaskRunStatus, error_codes,
};
use tasker_task_runtime::{RuntimeRegistry, TaskFault, TaskRuntime};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::result::{ExecutionOutcome, NestedOutcome, SuspensionData};

/// How one attempt of task code ended.
enum Attempt {
  Returned(Value),
  Faulted(TaskFault),
  Suspended(Suspension),
  Diverged(CallError),
}

/// Runs task functions for task runs and for nested task calls.
pub struct TaskExecutor {
  store: Arc<dyn Store>,
  runtimes: RuntimeRegistry,
  config: ExecutorConfig,
}

impl TaskExecutor {
  pub fn new(store: Arc<dyn Store>, runtimes: RuntimeRegistry, config: ExecutorConfig) -> Self {
    Self {
      store,
      runtimes,
      config,
    }
  }

  /// Run a `pending` task run for the first time.
  #[instrument(
    name = "task_execute",
    skip(self, run, function),
    fields(task_run_id = %run.id, task = %run.task_identifier)
  )]
  pub async fn execute(
    &self,
    run: &TaskRun,
    function: &TaskFunction,
  ) -> Result<ExecutionOutcome, EngineError> {
    self
      .drive(run, &run.input, function, &[TaskRunStatus::Pending])
      .await
  }

  /// Replay a task run whose calls have (partly) resolved.
  #[instrument(
    name = "task_resume",
    skip(self, run, input, function),
    fields(task_run_id = %run.id, task = %run.task_identifier)
  )]
  pub async fn resume(
    &self,
    run: &TaskRun,
    input: &Value,
    function: &TaskFunction,
  ) -> Result<ExecutionOutcome, EngineError> {
    self
      .drive(
        run,
        input,
        function,
        &[TaskRunStatus::SuspendedWaitingChild, TaskRunStatus::Pending],
      )
      .await
  }

  /// Run a nested task call as the body of `parent`, which the caller has
  /// claimed. Host calls made by the body are scoped under `parent`.
  ///
  /// An attempt that outlives `call_timeout` fails the call with
  /// `CALL_TIMEOUT`. Its blocking thread cannot be stopped and finishes
  /// in the background; whatever it returns is dropped.
  #[instrument(
    name = "task_nested",
    skip(self, parent, input, function),
    fields(task_run_id = %parent.task_run_id, stack_run_id = %parent.id, task = %function.name)
  )]
  pub async fn run_nested(
    &self,
    parent: &StackRun,
    input: Value,
    function: &TaskFunction,
    call_timeout: Duration,
  ) -> Result<NestedOutcome, EngineError> {
    let runtime = self.runtimes.resolve(function)?;
    let attempt = self.attempt(
      runtime,
      &parent.task_run_id,
      Some(&parent.id),
      function,
      input,
    );
    let attempt = match tokio::time::timeout(call_timeout, attempt).await {
      Ok(attempt) => attempt?,
      Err(_) => {
        let error = ErrorPayload::new(
          error_codes::CALL_TIMEOUT,
          format!(
            "task.{} timed out after {}ms",
            function.name,
            call_timeout.as_millis()
          ),
        );
        warn!(timeout_ms = call_timeout.as_millis() as u64, "nested_timed_out");
        return Ok(NestedOutcome::Failed(error));
      }
    };

    let suspension = match attempt {
      Attempt::Returned(output) => return Ok(NestedOutcome::Completed(output)),
      Attempt::Faulted(fault) => return Ok(NestedOutcome::Failed(fault.to_payload())),
      Attempt::Diverged(err) => return Ok(NestedOutcome::Failed(err.to_payload())),
      Attempt::Suspended(suspension) => suspension,
    };

    let child = self
      .child_stack_run(&parent.task_run_id, Some(&parent.id), suspension)
      .await?;

    self
      .store
      .update_stack_run(
        &parent.id,
        StackRunPatch {
          status: Some(StackRunStatus::SuspendedWaitingChild),
          claimed_by: Some(None),
          claim_expires_at: Some(None),
          ..Default::default()
        },
      )
      .await?;

    // The child may have resolved before the parent was parked, in which
    // case nobody else will wake the parent.
    let mut woken = false;
    if let Some(current) = self.store.get_stack_run(&child.id).await? {
      if let Some(resolution) = current.resolution() {
        let payload = serde_json::json!({
          "childStackRunId": current.id,
          "status": resolution.status().as_str(),
        });
        woken = self.store.wake_stack_run(&parent.id, payload).await?;
      }
    }

    debug!(child_stack_run_id = %child.id, woken, "nested_suspended");
    Ok(NestedOutcome::Suspended {
      child_stack_run_id: child.id,
      woken,
    })
  }

  async fn drive(
    &self,
    run: &TaskRun,
    input: &Value,
    function: &TaskFunction,
    from: &[TaskRunStatus],
  ) -> Result<ExecutionOutcome, EngineError> {
    if let Some(outcome) = ExecutionOutcome::from_terminal(run) {
      debug!(status = %run.status, "task run already finished");
      return Ok(outcome);
    }

    let runtime = self.runtimes.resolve(function)?;

    let Some(mut lease) = self.claim(&run.id, from).await? else {
      // Lost the race. A run that finished in the meantime still answers
      // with its stored result.
      return match self.store.get_task_run(&run.id).await? {
        Some(current) => ExecutionOutcome::from_terminal(&current).ok_or_else(|| {
          EngineError::TaskRunLocked {
            id: run.id.clone(),
          }
        }),
        None => Err(EngineError::TaskNotFound {
          id: run.id.clone(),
        }),
      };
    };

    info!(input = %input, "task_started");

    loop {
      let attempt = self
        .attempt(runtime.clone(), &run.id, None, function, input.clone())
        .await?;

      let suspension = match attempt {
        Attempt::Returned(output) => return self.complete(&run.id, &lease, output).await,
        Attempt::Faulted(fault) => return self.fail(&run.id, &lease, fault.to_payload()).await,
        Attempt::Diverged(err) => return self.fail(&run.id, &lease, err.to_payload()).await,
        Attempt::Suspended(suspension) => suspension,
      };

      let child = self.child_stack_run(&run.id, None, suspension).await?;

      self
        .release(
          &run.id,
          &lease,
          TaskRunPatch {
            status: Some(TaskRunStatus::SuspendedWaitingChild),
            ..Default::default()
          },
        )
        .await?;

      // The processor skips resuming a run it finds locked. If the child
      // resolved while this attempt held the lease, replay again now.
      let resolved = self
        .store
        .get_stack_run(&child.id)
        .await?
        .is_some_and(|current| current.is_resolved());

      if resolved {
        if let Some(next) = self
          .claim(&run.id, &[TaskRunStatus::SuspendedWaitingChild])
          .await?
        {
          debug!(child_stack_run_id = %child.id, "child resolved during attempt, replaying");
          lease = next;
          continue;
        }
      }

      info!(
        child_stack_run_id = %child.id,
        call = %child.operation,
        "task_suspended"
      );
      return Ok(ExecutionOutcome::suspended(
        run.id.clone(),
        SuspensionData::new(child.id.clone(), &child.operation),
      ));
    }
  }

  /// Claim the run under a fresh lease token. `None` when someone else
  /// holds it or it is in none of `from`.
  async fn claim(&self, id: &str, from: &[TaskRunStatus]) -> Result<Option<String>, EngineError> {
    let now = now();
    let lease_until = deadline(now, self.config.lease_ms);
    let token = format!("lease-{}", uuid::Uuid::new_v4());
    let won = self
      .store
      .claim_task_run(id, from, &token, lease_until, now)
      .await?;
    Ok(won.then_some(token))
  }

  /// Write the end of an attempt and give up the lease. Fails with
  /// `TaskRunLocked` when the lease expired and another executor took the
  /// run over; nothing is written in that case.
  async fn release(&self, id: &str, lease: &str, patch: TaskRunPatch) -> Result<(), EngineError> {
    if self.store.release_task_run(id, lease, patch).await? {
      return Ok(());
    }
    warn!(reason = "lease lost", "task_result_discarded");
    Err(EngineError::TaskRunLocked { id: id.to_string() })
  }

  /// One run of the task code from the top.
  async fn attempt(
    &self,
    runtime: Arc<dyn TaskRuntime>,
    task_run_id: &str,
    parent_stack_run_id: Option<&str>,
    function: &TaskFunction,
    input: Value,
  ) -> Result<Attempt, EngineError> {
    let history = self.store.list_stack_runs(task_run_id).await?;
    let host = HostCalls::new(Interceptor::new(
      task_run_id,
      parent_stack_run_id.map(str::to_string),
      history,
    ));

    let code = function.code.clone();
    let task_host = host.clone();
    let result = tokio::task::spawn_blocking(move || runtime.run(&code, input, task_host))
      .await
      .unwrap_or_else(|e| Err(TaskFault::raised(join_message(e))));

    // A halt wins over whatever the code returned, since the code may have
    // caught the halting error.
    Ok(match (host.halt(), result) {
      (Some(Halt::Suspended(suspension)), _) => Attempt::Suspended(suspension),
      (Some(Halt::Diverged(err)), _) => Attempt::Diverged(err),
      (None, Ok(output)) => Attempt::Returned(output),
      (None, Err(fault)) => Attempt::Faulted(fault),
    })
  }

  /// The stack run a suspension is waiting on, created if it is new.
  async fn child_stack_run(
    &self,
    task_run_id: &str,
    parent_stack_run_id: Option<&str>,
    suspension: Suspension,
  ) -> Result<StackRun, EngineError> {
    match suspension {
      Suspension::New {
        call_index,
        operation,
      } => {
        let created = self
          .store
          .create_stack_run(NewStackRun {
            task_run_id: task_run_id.to_string(),
            parent_stack_run_id: parent_stack_run_id.map(str::to_string),
            call_index,
            operation,
          })
          .await;
        match created {
          Ok(run) => Ok(run),
          // An executor that took over an expired lease may have recorded
          // the same call site first.
          Err(err) => self
            .store
            .list_stack_runs(task_run_id)
            .await?
            .into_iter()
            .find(|run| {
              run.parent_stack_run_id.as_deref() == parent_stack_run_id
                && run.call_index == call_index
            })
            .ok_or_else(|| err.into()),
        }
      }
      Suspension::Existing { stack_run_id, .. } => self
        .store
        .get_stack_run(&stack_run_id)
        .await?
        .ok_or_else(|| tasker_store::Error::NotFound(stack_run_id).into()),
    }
  }

  async fn complete(
    &self,
    id: &str,
    lease: &str,
    output: Value,
  ) -> Result<ExecutionOutcome, EngineError> {
    self
      .release(
        id,
        lease,
        TaskRunPatch {
          status: Some(TaskRunStatus::Completed),
          output: Some(output.clone()),
          completed_at: Some(now()),
          ..Default::default()
        },
      )
      .await?;

    info!(output = %output, "task_completed");
    Ok(ExecutionOutcome::completed(id, output))
  }

  async fn fail(
    &self,
    id: &str,
    lease: &str,
    error: ErrorPayload,
  ) -> Result<ExecutionOutcome, EngineError> {
    self
      .release(
        id,
        lease,
        TaskRunPatch {
          status: Some(TaskRunStatus::Failed),
          error: Some(error.to_value()),
          completed_at: Some(now()),
          ..Default::default()
        },
      )
      .await?;

    error!(code = %error.code, error = %error.message, "task_failed");
    Ok(ExecutionOutcome::failed(id, &error))
  }
}

/// `now` plus `ms` milliseconds, saturating.
pub(crate) fn deadline(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
  i64::try_from(ms)
    .ok()
    .and_then(TimeDelta::try_milliseconds)
    .and_then(|delta| now.checked_add_signed(delta))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn join_message(err: JoinError) -> String {
  if !err.is_panic() {
    return "task attempt was cancelled".to_string();
  }
  let panic = err.into_panic();
  let detail = panic
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| panic.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string());
  format!("task code panicked: {}", detail)
}
