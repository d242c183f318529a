//! LuaRuntime against an in-memory interceptor.

use serde_json::{Value, json};
use tasker_host::{CallError, Halt, HostCalls, Interceptor, Suspension};
use tasker_store::serializer::now;
use tasker_store::{CallDescriptor, StackRun, StackRunStatus, error_codes};
use tasker_task_runtime::{TaskFault, TaskRuntime};
use tasker_task_runtime_lua::LuaRuntime;

const LOOKUP_TASK: &str = r#"
local found = host.call("directory", "lookup", input.domain)
return { domains = found.domains, count = #found.domains }
"#;

fn resolved(call_index: u32, operation: CallDescriptor, result: Result<Value, Value>) -> StackRun {
  let ts = now();
  let (status, output, error) = match result {
    Ok(v) => (StackRunStatus::Completed, Some(v), None),
    Err(e) => (StackRunStatus::Failed, None, Some(e)),
  };
  StackRun {
    id: format!("stack-{}", call_index),
    task_run_id: "run-1".to_string(),
    parent_stack_run_id: None,
    call_index,
    input: Value::Array(operation.args.clone()),
    operation,
    status,
    output,
    error,
    resume_payload: None,
    claimed_by: None,
    claim_expires_at: None,
    created_at: ts,
    updated_at: ts,
    completed_at: Some(ts),
  }
}

fn host(history: Vec<StackRun>) -> HostCalls {
  HostCalls::new(Interceptor::new("run-1", None, history))
}

fn lookup(domain: &str) -> CallDescriptor {
  CallDescriptor::new("directory", "lookup", vec![json!(domain)])
}

#[test]
fn test_echo_without_calls() {
  let host = host(Vec::new());
  let output = LuaRuntime::new()
    .run("return { success = true, data = input }", json!({"x": 1}), host.clone())
    .expect("echo should complete");

  assert_eq!(output, json!({"success": true, "data": {"x": 1}}));
  assert!(host.issued().is_empty());
  assert!(host.halt().is_none());
}

#[test]
fn test_input_is_also_the_chunk_vararg() {
  let output = LuaRuntime::new()
    .run("local args = ...\nreturn args.n * 2", json!({"n": 21}), host(Vec::new()))
    .expect("should complete");
  assert_eq!(output, json!(42));
}

#[test]
fn test_unmemoized_call_suspends() {
  let host = host(Vec::new());
  let fault = LuaRuntime::new()
    .run(LOOKUP_TASK, json!({"domain": "a.com"}), host.clone())
    .expect_err("should suspend");

  assert!(matches!(fault, TaskFault::Call(CallError::Suspended { .. })));
  assert_eq!(
    host.halt(),
    Some(Halt::Suspended(Suspension::New {
      call_index: 0,
      operation: lookup("a.com"),
    }))
  );
}

#[test]
fn test_memoized_call_completes() {
  let history = vec![resolved(0, lookup("a.com"), Ok(json!({"domains": ["a.com"]})))];
  let output = LuaRuntime::new()
    .run(LOOKUP_TASK, json!({"domain": "a.com"}), host(history))
    .expect("should complete");

  assert_eq!(output, json!({"domains": ["a.com"], "count": 1}));
}

#[test]
fn test_replay_issues_same_calls() {
  let code = r#"
    local a = host.call("directory", "lookup", "a.com")
    local b = host.call("directory", "lookup", "b.com")
    return { a, b }
  "#;
  let history = vec![resolved(0, lookup("a.com"), Ok(json!(1)))];

  let first = host(history.clone());
  let second = host(history);
  let _ = LuaRuntime::new().run(code, json!({}), first.clone());
  let _ = LuaRuntime::new().run(code, json!({}), second.clone());

  assert_eq!(first.issued(), vec![lookup("a.com"), lookup("b.com")]);
  assert_eq!(first.issued(), second.issued());
}

#[test]
fn test_uncaught_call_failure_fails_task() {
  let failure = json!({"code": "STACK_CALL_ERROR", "message": "directory down"});
  let history = vec![resolved(0, lookup("a.com"), Err(failure))];
  let fault = LuaRuntime::new()
    .run(LOOKUP_TASK, json!({"domain": "a.com"}), host(history))
    .expect_err("should fail");

  assert_eq!(fault.to_payload().code, error_codes::STACK_CALL_ERROR);
  assert_eq!(fault.to_payload().message, "directory down");
}

#[test]
fn test_try_call_lets_task_recover() {
  let code = r#"
    local ok, res = host.try_call("directory", "lookup", "a.com")
    if ok then return { found = res } end
    return { recovered = true, code = res.code }
  "#;
  let failure = json!({"code": "CALL_TIMEOUT", "message": "slow"});
  let history = vec![resolved(0, lookup("a.com"), Err(failure))];

  let output = LuaRuntime::new()
    .run(code, json!({}), host(history))
    .expect("should recover");
  assert_eq!(output, json!({"recovered": true, "code": "CALL_TIMEOUT"}));
}

#[test]
fn test_swallowed_suspension_still_halts() {
  let code = r#"
    local ok = pcall(host.call, "directory", "lookup", "a.com")
    local again = pcall(host.call, "directory", "lookup", "b.com")
    return { ok = ok, again = again }
  "#;
  let host = host(Vec::new());
  let result = LuaRuntime::new().run(code, json!({}), host.clone());

  assert!(result.is_ok(), "code caught the error and returned");
  assert!(matches!(host.halt(), Some(Halt::Suspended(_))));
  assert_eq!(host.issued(), vec![lookup("a.com")]);
}

#[test]
fn test_raised_error_message() {
  let fault = LuaRuntime::new()
    .run("error('boom')", json!({}), host(Vec::new()))
    .expect_err("should fail");

  match fault {
    TaskFault::Raised { message, .. } => assert!(message.contains("boom")),
    other => panic!("unexpected fault: {:?}", other),
  }
}

#[test]
fn test_memory_limit_stops_runaway_allocation() {
  let runtime = LuaRuntime::new().with_memory_limit(256 * 1024);

  let output = runtime
    .run("return input.n + 1", json!({"n": 1}), host(Vec::new()))
    .expect("small task fits");
  assert_eq!(output, json!(2));

  let fault = runtime
    .run(
      "local t = {}\nfor i = 1, 1000000 do t[i] = string.rep('x', 64) .. i end\nreturn #t",
      json!({}),
      host(Vec::new()),
    )
    .expect_err("should exceed the limit");
  assert!(matches!(fault, TaskFault::Raised { .. }));
}

#[test]
fn test_syntax_error_is_raised() {
  let fault = LuaRuntime::new()
    .run("return {", json!({}), host(Vec::new()))
    .expect_err("should fail");
  assert!(matches!(fault, TaskFault::Raised { .. }));
}

#[test]
fn test_sandbox_has_no_nondeterministic_sources() {
  let output = LuaRuntime::new()
    .run(
      "return { os = os == nil, io = io == nil, random = math.random == nil, floor = math.floor(2.5) }",
      json!({}),
      host(Vec::new()),
    )
    .expect("should complete");

  assert_eq!(
    output,
    json!({"os": true, "io": true, "random": true, "floor": 2})
  );
}

#[test]
fn test_nested_task_call_descriptor() {
  let host = host(Vec::new());
  let _ = LuaRuntime::new().run(
    "return host.task('child', { n = 1 })",
    json!({}),
    host.clone(),
  );
  assert_eq!(
    host.issued(),
    vec![CallDescriptor::new("task", "child", vec![json!({"n": 1})])]
  );
}
