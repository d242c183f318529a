use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tasker_host::HostCalls;

use crate::{TaskFault, TaskRuntime};

/// A task written in Rust.
pub type NativeTask = Arc<dyn Fn(Value, &HostCalls) -> Result<Value, TaskFault> + Send + Sync>;

/// Runtime for tasks registered as Rust functions. A task function using
/// this runtime stores the registered name as its code.
#[derive(Default, Clone)]
pub struct NativeRuntime {
  tasks: HashMap<String, NativeTask>,
}

impl NativeRuntime {
  pub const NAME: &'static str = "native";

  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<F>(&mut self, name: impl Into<String>, task: F)
  where
    F: Fn(Value, &HostCalls) -> Result<Value, TaskFault> + Send + Sync + 'static,
  {
    self.tasks.insert(name.into(), Arc::new(task));
  }

  pub fn with<F>(mut self, name: impl Into<String>, task: F) -> Self
  where
    F: Fn(Value, &HostCalls) -> Result<Value, TaskFault> + Send + Sync + 'static,
  {
    self.register(name, task);
    self
  }
}

impl TaskRuntime for NativeRuntime {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn run(&self, code: &str, input: Value, host: HostCalls) -> Result<Value, TaskFault> {
    let name = code.trim();
    let task = self
      .tasks
      .get(name)
      .ok_or_else(|| TaskFault::raised(format!("native task '{}' is not registered", name)))?;
    task(input, &host)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tasker_host::{CallError, Interceptor};

  #[test]
  fn test_call_suspension_propagates_with_question_mark() {
    let runtime = NativeRuntime::new().with("lookup", |input, host| {
      let found = host.call("directory", "lookup", vec![input["domain"].clone()])?;
      Ok(json!({ "found": found }))
    });
    let host = HostCalls::new(Interceptor::new("run-1", None, Vec::new()));

    let fault = runtime
      .run("lookup", json!({"domain": "a.com"}), host.clone())
      .expect_err("should suspend");
    assert!(matches!(fault, TaskFault::Call(CallError::Suspended { .. })));
    assert_eq!(host.issued().len(), 1);
  }

  #[test]
  fn test_unregistered_task_is_raised() {
    let host = HostCalls::new(Interceptor::new("run-1", None, Vec::new()));
    let fault = NativeRuntime::new()
      .run("missing", json!({}), host)
      .expect_err("not registered");
    assert!(matches!(fault, TaskFault::Raised { .. }));
  }
}
