//! End-to-end executor and processor behaviour against real stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tasker_config::{Config, ProcessorConfig};
use tasker_engine::{EngineError, ExecutionOutcome, StackProcessor, TaskExecutor, TaskService};
use tasker_host::{
  CallContext, KEYSTORE_SERVICE, KeystoreHandler, ServiceError, ServiceHandler, ServiceRegistry,
};
use tasker_store::serializer::now;
use tasker_store::{
  MemoryStore, NewTaskFunction, SqliteStore, StackRunResolution, StackRunStatus, Store,
  TaskRunStatus, error_codes,
};
use tasker_task_runtime::{NativeRuntime, RuntimeRegistry};
use tasker_task_runtime_lua::LuaRuntime;

const ECHO_TASK: &str = "return { success = true, data = input }";

const LOOKUP_TASK: &str = r#"
local found = host.call("directory", "lookup", input.domain)
return { domain = input.domain, domains = found.domains, count = #found.domains }
"#;

const PARENT_TASK: &str = r#"
local child = host.task("lookup", { domain = input.domain })
return { via_child = child.count }
"#;

/// Directory service that counts how often it is actually called.
#[derive(Default)]
struct Directory {
  calls: AtomicUsize,
  delay: Option<Duration>,
  fail: bool,
}

impl Directory {
  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ServiceHandler for Directory {
  async fn call(
    &self,
    _ctx: &CallContext,
    method: &str,
    args: &[Value],
  ) -> Result<Value, ServiceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail {
      return Err(ServiceError::failed("directory down"));
    }
    match method {
      "lookup" => Ok(json!({ "domains": [args.first().cloned().unwrap_or(Value::Null)] })),
      other => Err(ServiceError::UnknownMethod {
        service: "directory".to_string(),
        method: other.to_string(),
      }),
    }
  }
}

struct Harness {
  store: Arc<dyn Store>,
  directory: Arc<Directory>,
  service: TaskService,
  config: Config,
}

impl Harness {
  fn new(store: Arc<dyn Store>, directory: Directory, native: NativeRuntime, config: Config) -> Self {
    let directory = Arc::new(directory);
    let service = TaskService::new(store.clone(), runtimes(native), services(&directory), &config);
    Self {
      store,
      directory,
      service,
      config,
    }
  }

  fn memory(directory: Directory) -> Self {
    Self::new(
      Arc::new(MemoryStore::new()),
      directory,
      NativeRuntime::new(),
      Config::default(),
    )
  }

  fn processor(&self, worker_id: &str) -> StackProcessor {
    let executor = Arc::new(TaskExecutor::new(
      self.store.clone(),
      runtimes(NativeRuntime::new()),
      self.config.executor.clone(),
    ));
    StackProcessor::new(
      self.store.clone(),
      executor,
      services(&self.directory),
      ProcessorConfig {
        worker_id: Some(worker_id.to_string()),
        ..self.config.processor.clone()
      },
    )
  }

  async fn function(&self, name: &str, code: &str) {
    self
      .service
      .store_function(NewTaskFunction {
        name: name.to_string(),
        code: code.to_string(),
        metadata: json!({}),
      })
      .await
      .expect("failed to store function");
  }

  async fn native_function(&self, name: &str) {
    self
      .service
      .store_function(NewTaskFunction {
        name: name.to_string(),
        code: name.to_string(),
        metadata: json!({"runtime": "native"}),
      })
      .await
      .expect("failed to store function");
  }

  async fn submit_and_execute(&self, task: &str, input: Value) -> (String, ExecutionOutcome) {
    let run = self
      .service
      .submit(task, input)
      .await
      .expect("failed to submit");
    let outcome = self
      .service
      .execute(&run.id)
      .await
      .expect("failed to execute");
    (run.id, outcome)
  }

  async fn status(&self, id: &str) -> tasker_store::TaskRun {
    self.service.status(id).await.expect("failed to get status")
  }
}

fn runtimes(native: NativeRuntime) -> RuntimeRegistry {
  RuntimeRegistry::new("lua").with(LuaRuntime::new()).with(native)
}

fn services(directory: &Arc<Directory>) -> ServiceRegistry {
  let mut registry = ServiceRegistry::new().with(KEYSTORE_SERVICE, KeystoreHandler);
  registry.register("directory", directory.clone());
  registry
}

async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<dyn Store> {
  let store = SqliteStore::connect(&dir.path().join("tasker.db"))
    .await
    .expect("failed to open sqlite store");
  store.init().await.expect("failed to migrate");
  Arc::new(store)
}

#[tokio::test]
async fn test_echo_completes_without_stack_runs() {
  let h = Harness::memory(Directory::default());
  h.function("echo", ECHO_TASK).await;

  let (id, outcome) = h.submit_and_execute("echo", json!({"x": 1})).await;

  assert_eq!(
    outcome,
    ExecutionOutcome::completed(id.clone(), json!({"success": true, "data": {"x": 1}}))
  );
  assert!(h.service.stack_runs(&id).await.expect("stack runs").is_empty());
  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert!(run.started_at.is_some());
  assert!(run.completed_at.is_some());
}

async fn lookup_round_trip(h: &Harness) {
  h.function("lookup", LOOKUP_TASK).await;

  let (id, outcome) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  let suspension = outcome.suspension().expect("should suspend").clone();
  assert_eq!(suspension.service_name, "directory");
  assert_eq!(suspension.method_path, "lookup");
  assert_eq!(h.status(&id).await.status, TaskRunStatus::SuspendedWaitingChild);

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.completed, 1);
  assert_eq!(summary.resumed.len(), 1);

  let expected = json!({"domain": "a.com", "domains": ["a.com"], "count": 1});
  assert_eq!(summary.resumed[0], ExecutionOutcome::completed(id.clone(), expected.clone()));

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert_eq!(run.output, Some(expected));

  let stack_runs = h.service.stack_runs(&id).await.expect("stack runs");
  assert_eq!(stack_runs.len(), 1);
  assert_eq!(stack_runs[0].id, suspension.child_stack_run_id);
  assert_eq!(stack_runs[0].status, StackRunStatus::Completed);
  assert_eq!(h.directory.calls(), 1);
}

#[tokio::test]
async fn test_lookup_suspends_and_resumes_memory() {
  lookup_round_trip(&Harness::memory(Directory::default())).await;
}

#[tokio::test]
async fn test_lookup_suspends_and_resumes_sqlite() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let h = Harness::new(
    sqlite_store(&dir).await,
    Directory::default(),
    NativeRuntime::new(),
    Config::default(),
  );
  lookup_round_trip(&h).await;
}

async fn call_sites(h: &Harness, id: &str) -> Vec<(u32, tasker_store::CallDescriptor)> {
  h.service
    .stack_runs(id)
    .await
    .expect("stack runs")
    .into_iter()
    .map(|run| (run.call_index, run.operation))
    .collect()
}

#[tokio::test]
async fn test_replay_issues_same_calls() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;

  let (first, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  let (second, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;

  assert_eq!(call_sites(&h, &first).await, call_sites(&h, &second).await);
}

#[tokio::test]
async fn test_concurrent_processors_call_once() {
  let h = Harness::memory(Directory {
    delay: Some(Duration::from_millis(20)),
    ..Default::default()
  });
  h.function("lookup", LOOKUP_TASK).await;
  let (id, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;

  let mut workers = tokio::task::JoinSet::new();
  for i in 0..8 {
    let processor = h.processor(&format!("worker-{}", i));
    workers.spawn(async move { processor.process_pending().await });
  }

  let mut claimed = 0;
  while let Some(result) = workers.join_next().await {
    let summary = result
      .expect("worker panicked")
      .expect("failed to process");
    claimed += summary.claimed;
  }

  assert_eq!(claimed, 1);
  assert_eq!(h.directory.calls(), 1);
  assert_eq!(h.status(&id).await.status, TaskRunStatus::Completed);
}

#[tokio::test]
async fn test_resume_of_completed_run_is_noop() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  let (id, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  h.service.process().await.expect("failed to process");

  let run = h.status(&id).await;
  let function = h
    .store
    .get_task_function("lookup")
    .await
    .expect("failed to get function")
    .expect("function exists");

  let again = h
    .service
    .executor()
    .resume(&run, &run.input, &function)
    .await
    .expect("failed to resume");
  assert_eq!(again, ExecutionOutcome::from_terminal(&run).expect("terminal"));
  assert_eq!(h.service.execute(&id).await.expect("execute"), again);

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.claimed, 0);
  assert_eq!(h.service.stack_runs(&id).await.expect("stack runs").len(), 1);
  assert_eq!(h.directory.calls(), 1);
  assert_eq!(h.status(&id).await.updated_at, run.updated_at);
}

#[tokio::test]
async fn test_failed_call_fails_task_when_uncaught() {
  let h = Harness::memory(Directory {
    fail: true,
    ..Default::default()
  });
  h.function("lookup", LOOKUP_TASK).await;
  let (id, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.failed, 1);

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Failed);
  let error = run.error.expect("error stored");
  assert_eq!(error["code"], error_codes::STACK_CALL_ERROR);
  assert_eq!(error["message"], "directory down");
}

#[tokio::test]
async fn test_failed_call_can_be_caught() {
  let h = Harness::memory(Directory {
    fail: true,
    ..Default::default()
  });
  h.function(
    "tolerant",
    r#"
      local ok, res = host.try_call("directory", "lookup", input.domain)
      if ok then return res end
      return { fallback = true, reason = res.message }
    "#,
  )
  .await;
  let (id, _) = h.submit_and_execute("tolerant", json!({"domain": "a.com"})).await;
  h.service.process().await.expect("failed to process");

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert_eq!(
    run.output,
    Some(json!({"fallback": true, "reason": "directory down"}))
  );
}

#[tokio::test]
async fn test_raised_error_fails_task() {
  let h = Harness::memory(Directory::default());
  h.function("broken", "error('bad input')").await;

  let (id, outcome) = h.submit_and_execute("broken", json!({})).await;
  let error = outcome.error().expect("should fail");
  assert_eq!(error.code, error_codes::EXECUTION_ERROR);
  assert!(error.message.contains("bad input"));
  assert_eq!(h.status(&id).await.status, TaskRunStatus::Failed);
}

#[tokio::test]
async fn test_nested_task_call() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  h.function("parent", PARENT_TASK).await;

  let (id, outcome) = h.submit_and_execute("parent", json!({"domain": "a.com"})).await;
  let suspension = outcome.suspension().expect("should suspend").clone();
  assert_eq!(suspension.service_name, "task");
  assert_eq!(suspension.method_path, "lookup");

  // First pass runs the nested body, which parks on its own call.
  let first = h.service.process().await.expect("failed to process");
  assert_eq!(first.suspended, 1);
  let parked = h
    .store
    .get_stack_run(&suspension.child_stack_run_id)
    .await
    .expect("failed to get stack run")
    .expect("stack run exists");
  assert_eq!(parked.status, StackRunStatus::SuspendedWaitingChild);
  assert!(parked.claimed_by.is_none());

  // Second pass resolves the inner call, wakes the parent and finishes.
  let second = h.service.process().await.expect("failed to process");
  assert_eq!(second.completed, 2);
  assert_eq!(second.resumed.len(), 1);

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert_eq!(run.output, Some(json!({"via_child": 1})));

  let stack_runs = h.service.stack_runs(&id).await.expect("stack runs");
  assert_eq!(stack_runs.len(), 2);
  let inner = stack_runs
    .iter()
    .find(|run| run.parent_stack_run_id.is_some())
    .expect("nested stack run");
  assert_eq!(
    inner.parent_stack_run_id.as_deref(),
    Some(suspension.child_stack_run_id.as_str())
  );
  let parent = stack_runs
    .iter()
    .find(|run| run.id == suspension.child_stack_run_id)
    .expect("parent stack run");
  assert_eq!(
    parent.resume_payload,
    Some(json!({"childStackRunId": inner.id, "status": "completed"}))
  );
}

/// Claim and resolve a stack run the way a worker would, then stop before
/// waking or resuming anything.
async fn resolve_and_crash(h: &Harness, stack_run_id: &str, output: Value) {
  let now = now();
  assert!(
    h.store
      .claim_stack_run(stack_run_id, "crashed", now, now + chrono::Duration::minutes(1))
      .await
      .expect("failed to claim")
  );
  assert!(
    h.store
      .resolve_stack_run(stack_run_id, "crashed", StackRunResolution::Completed(output))
      .await
      .expect("failed to resolve")
  );
}

#[tokio::test]
async fn test_parent_woken_after_worker_crash() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  h.function("parent", PARENT_TASK).await;

  let (id, outcome) = h.submit_and_execute("parent", json!({"domain": "a.com"})).await;
  let parent_id = outcome.suspension().expect("should suspend").child_stack_run_id.clone();
  h.service.process().await.expect("failed to process");

  let inner = h
    .service
    .stack_runs(&id)
    .await
    .expect("stack runs")
    .into_iter()
    .find(|run| run.parent_stack_run_id.as_deref() == Some(parent_id.as_str()))
    .expect("nested stack run");
  resolve_and_crash(&h, &inner.id, json!({"domains": ["a.com"]})).await;

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.woken, 1);
  assert_eq!(summary.resumed.len(), 1);

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert_eq!(run.output, Some(json!({"via_child": 1})));
  assert_eq!(h.directory.calls(), 0);

  let parent = h
    .store
    .get_stack_run(&parent_id)
    .await
    .expect("failed to get stack run")
    .expect("stack run exists");
  assert_eq!(parent.status, StackRunStatus::Completed);
  assert_eq!(
    parent.resume_payload,
    Some(json!({"childStackRunId": inner.id, "status": "completed"}))
  );
}

#[tokio::test]
async fn test_task_run_resumed_after_worker_crash() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let h = Harness::new(
    sqlite_store(&dir).await,
    Directory::default(),
    NativeRuntime::new(),
    Config::default(),
  );
  h.function("lookup", LOOKUP_TASK).await;
  let (id, outcome) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  let child = outcome.suspension().expect("should suspend").child_stack_run_id.clone();
  resolve_and_crash(&h, &child, json!({"domains": ["a.com"]})).await;

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.claimed, 0);
  assert_eq!(summary.resumed.len(), 1);

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Completed);
  assert_eq!(
    run.output,
    Some(json!({"domain": "a.com", "domains": ["a.com"], "count": 1}))
  );

  let again = h.service.process().await.expect("failed to process");
  assert!(again.resumed.is_empty());
}

#[tokio::test]
async fn test_expired_task_lease_is_resumed() {
  let h = Harness::memory(Directory::default());
  h.function("echo", ECHO_TASK).await;
  let run = h.service.submit("echo", json!({"x": 1})).await.expect("failed to submit");

  // An executor claimed the run and died before finishing.
  let past = now() - chrono::Duration::seconds(10);
  assert!(
    h.store
      .claim_task_run(
        &run.id,
        &[TaskRunStatus::Pending],
        "crashed",
        past + chrono::Duration::seconds(1),
        past
      )
      .await
      .expect("failed to claim")
  );

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.resumed.len(), 1);

  let stored = h.status(&run.id).await;
  assert_eq!(stored.status, TaskRunStatus::Completed);
  assert_eq!(stored.output, Some(json!({"success": true, "data": {"x": 1}})));
  assert!(stored.locked_by.is_none());
}

#[tokio::test]
async fn test_slow_nested_task_times_out() {
  let mut config = Config::default();
  config.processor.call_timeout_ms = 50;
  let native = NativeRuntime::new().with("sleeper", |_, _| {
    std::thread::sleep(Duration::from_secs(2));
    Ok(json!("done"))
  });
  let h = Harness::new(
    Arc::new(MemoryStore::new()),
    Directory::default(),
    native,
    config,
  );
  h.native_function("sleeper").await;
  h.function("parent", "return host.task('sleeper', {})").await;

  let (id, outcome) = h.submit_and_execute("parent", json!({})).await;
  let nested = outcome.suspension().expect("should suspend").child_stack_run_id.clone();

  let started = std::time::Instant::now();
  let summary = h.service.process().await.expect("failed to process");
  assert!(started.elapsed() < Duration::from_millis(1500));
  assert_eq!(summary.failed, 1);
  assert_eq!(summary.completed, 0);

  let stack_run = h
    .store
    .get_stack_run(&nested)
    .await
    .expect("failed to get stack run")
    .expect("stack run exists");
  assert_eq!(stack_run.status, StackRunStatus::Failed);
  assert_eq!(
    stack_run.error.expect("error stored")["code"],
    error_codes::CALL_TIMEOUT
  );
  assert_eq!(h.status(&id).await.status, TaskRunStatus::Failed);
}

#[tokio::test]
async fn test_nested_call_to_missing_function_fails() {
  let h = Harness::memory(Directory::default());
  h.function("parent", "return host.task('nowhere', {})").await;
  let (id, _) = h.submit_and_execute("parent", json!({})).await;

  h.service.process().await.expect("failed to process");

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Failed);
  assert_eq!(
    run.error.expect("error stored")["code"],
    error_codes::TASK_FUNCTION_NOT_FOUND
  );
}

#[tokio::test]
async fn test_divergent_replay_fails_task() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let seen = attempts.clone();
  let native = NativeRuntime::new().with("flaky", move |_, host| {
    let domain = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
      "a.com"
    } else {
      "b.com"
    };
    let found = host.call("directory", "lookup", vec![json!(domain)])?;
    Ok(found)
  });
  let h = Harness::new(
    Arc::new(MemoryStore::new()),
    Directory::default(),
    native,
    Config::default(),
  );
  h.native_function("flaky").await;

  let (id, _) = h.submit_and_execute("flaky", json!({})).await;
  h.service.process().await.expect("failed to process");

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Failed);
  assert_eq!(
    run.error.expect("error stored")["code"],
    error_codes::NON_DETERMINISTIC_REPLAY
  );
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_slow_call_times_out() {
  let mut config = Config::default();
  config.processor.call_timeout_ms = 50;
  let h = Harness::new(
    Arc::new(MemoryStore::new()),
    Directory {
      delay: Some(Duration::from_secs(5)),
      ..Default::default()
    },
    NativeRuntime::new(),
    config,
  );
  h.function("lookup", LOOKUP_TASK).await;
  let (id, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.failed, 1);

  let run = h.status(&id).await;
  assert_eq!(run.status, TaskRunStatus::Failed);
  assert_eq!(run.error.expect("error stored")["code"], error_codes::CALL_TIMEOUT);
}

#[tokio::test]
async fn test_unknown_service_fails_call() {
  let h = Harness::memory(Directory::default());
  h.function("mystery", "return host.call('nope', 'anything')").await;
  let (id, _) = h.submit_and_execute("mystery", json!({})).await;

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.failed, 1);

  let run = h.status(&id).await;
  assert_eq!(run.error.expect("error stored")["code"], error_codes::UNKNOWN_SERVICE);
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  let (id, outcome) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  let child = outcome.suspension().expect("should suspend").child_stack_run_id.clone();

  // A worker claimed the call and died; its claim has already expired.
  let past = now() - chrono::Duration::seconds(10);
  let won = h
    .store
    .claim_stack_run(&child, "dead-worker", past, past + chrono::Duration::seconds(1))
    .await
    .expect("failed to claim");
  assert!(won);

  let summary = h.processor("rescuer").process_pending().await.expect("failed to process");
  assert_eq!(summary.claimed, 1);
  assert_eq!(h.status(&id).await.status, TaskRunStatus::Completed);

  let resolved = h
    .store
    .get_stack_run(&child)
    .await
    .expect("failed to get stack run")
    .expect("stack run exists");
  assert_eq!(resolved.status, StackRunStatus::Completed);
  assert!(resolved.claimed_by.is_none());
  assert_eq!(h.directory.calls(), 1);
}

#[tokio::test]
async fn test_live_claim_is_skipped() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  let (_, outcome) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;
  let child = outcome.suspension().expect("should suspend").child_stack_run_id.clone();

  let now = now();
  assert!(
    h.store
      .claim_stack_run(&child, "busy-worker", now, now + chrono::Duration::minutes(5))
      .await
      .expect("failed to claim")
  );

  let summary = h.service.process().await.expect("failed to process");
  assert_eq!(summary.claimed, 0);
  assert_eq!(h.directory.calls(), 0);
}

#[tokio::test]
async fn test_locked_task_run_is_reported() {
  let h = Harness::memory(Directory::default());
  h.function("echo", ECHO_TASK).await;
  let run = h.service.submit("echo", json!({})).await.expect("failed to submit");

  let now = now();
  assert!(
    h.store
      .claim_task_run(
        &run.id,
        &[TaskRunStatus::Pending],
        "other-executor",
        now + chrono::Duration::minutes(5),
        now
      )
      .await
      .expect("failed to claim")
  );

  let err = h.service.execute(&run.id).await.expect_err("should be locked");
  assert!(matches!(err, EngineError::TaskRunLocked { .. }));
  assert_eq!(err.error_code(), "TASK_RUN_LOCKED");
}

#[tokio::test]
async fn test_missing_records_are_not_found() {
  let h = Harness::memory(Directory::default());

  let err = h.service.execute("missing").await.expect_err("no such run");
  assert!(err.is_not_found());
  assert_eq!(err.error_code(), "TASK_NOT_FOUND");

  let run = h.service.submit("ghost", json!({})).await.expect("failed to submit");
  let err = h.service.execute(&run.id).await.expect_err("no such function");
  assert!(matches!(err, EngineError::TaskFunctionNotFound { .. }));
  assert!(err.is_not_found());
}

#[tokio::test]
async fn test_keystore_from_task_code() {
  let h = Harness::memory(Directory::default());
  h.service
    .set_keystore("greeting", json!("hello"), json!({}))
    .await
    .expect("failed to set keystore");
  h.function(
    "greet",
    "return { greeting = host.call('keystore', 'get', 'greeting') }",
  )
  .await;

  let (id, _) = h.submit_and_execute("greet", json!({})).await;
  h.service.process().await.expect("failed to process");

  assert_eq!(h.status(&id).await.output, Some(json!({"greeting": "hello"})));
}

#[tokio::test]
async fn test_work_loop_stops_on_cancel() {
  let h = Harness::memory(Directory::default());
  h.function("lookup", LOOKUP_TASK).await;
  let (id, _) = h.submit_and_execute("lookup", json!({"domain": "a.com"})).await;

  let processor = h.processor("looper");
  let cancel = tokio_util::sync::CancellationToken::new();
  let stop = cancel.clone();
  let worker = tokio::spawn(async move {
    processor
      .run_until_cancelled(Duration::from_millis(10), stop)
      .await
  });

  for _ in 0..100 {
    if h.status(&id).await.status == TaskRunStatus::Completed {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  cancel.cancel();
  worker.await.expect("worker panicked");

  assert_eq!(h.status(&id).await.status, TaskRunStatus::Completed);
}
