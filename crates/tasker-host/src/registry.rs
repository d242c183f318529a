//! Service dispatch table: service name to handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tasker_store::Store;

use crate::error::ServiceError;

/// Context handed to a service handler for one call.
#[derive(Clone)]
pub struct CallContext {
  /// Task run that issued the call.
  pub task_run_id: String,
  /// Stack run being processed.
  pub stack_run_id: String,
  /// Record store, for handlers that need credentials or other records.
  pub store: Arc<dyn Store>,
}

/// Performs calls for one service name.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
  /// Perform `method` with `args`. Errors are recorded on the stack run.
  async fn call(
    &self,
    ctx: &CallContext,
    method: &str,
    args: &[Value],
  ) -> Result<Value, ServiceError>;
}

/// Handler backed by a synchronous closure `(method, args) -> result`.
pub struct FnHandler<F> {
  f: F,
}

impl<F> FnHandler<F>
where
  F: Fn(&str, &[Value]) -> Result<Value, ServiceError> + Send + Sync,
{
  pub fn new(f: F) -> Self {
    Self { f }
  }
}

#[async_trait]
impl<F> ServiceHandler for FnHandler<F>
where
  F: Fn(&str, &[Value]) -> Result<Value, ServiceError> + Send + Sync,
{
  async fn call(
    &self,
    _ctx: &CallContext,
    method: &str,
    args: &[Value],
  ) -> Result<Value, ServiceError> {
    (self.f)(method, args)
  }
}

/// Registered service handlers.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
  handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler, replacing any previous handler for `name`.
  pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
    self.handlers.insert(name.into(), handler);
  }

  /// Builder form of [`register`](Self::register).
  pub fn with(mut self, name: impl Into<String>, handler: impl ServiceHandler + 'static) -> Self {
    self.register(name, Arc::new(handler));
    self
  }

  /// Register a synchronous closure as a service.
  pub fn with_fn<F>(self, name: impl Into<String>, f: F) -> Self
  where
    F: Fn(&str, &[Value]) -> Result<Value, ServiceError> + Send + Sync + 'static,
  {
    self.with(name, FnHandler::new(f))
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
    self.handlers.get(name).cloned()
  }

  /// Registered service names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}

/// The `index`-th argument as a string.
pub fn string_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, ServiceError> {
  args
    .get(index)
    .and_then(Value::as_str)
    .ok_or_else(|| ServiceError::InvalidArguments {
      message: format!("argument {} ({}) must be a string", index, name),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tasker_store::MemoryStore;

  fn ctx() -> CallContext {
    CallContext {
      task_run_id: "run-1".to_string(),
      stack_run_id: "stack-1".to_string(),
      store: Arc::new(MemoryStore::new()),
    }
  }

  #[tokio::test]
  async fn test_dispatch_by_service_name() {
    let registry = ServiceRegistry::new()
      .with_fn("directory", |method, args| match method {
        "lookup" => Ok(json!({ "domains": [args[0].clone()] })),
        other => Err(ServiceError::UnknownMethod {
          service: "directory".to_string(),
          method: other.to_string(),
        }),
      })
      .with_fn("clock", |_, _| Ok(json!(0)));

    assert_eq!(registry.names(), vec!["clock", "directory"]);
    assert!(registry.get("missing").is_none());

    let handler = registry.get("directory").expect("registered");
    let value = handler
      .call(&ctx(), "lookup", &[json!("a.com")])
      .await
      .expect("lookup");
    assert_eq!(value, json!({"domains": ["a.com"]}));

    let err = handler
      .call(&ctx(), "delete", &[])
      .await
      .expect_err("unknown method");
    assert!(matches!(err, ServiceError::UnknownMethod { .. }));
  }

  #[test]
  fn test_string_arg() {
    let args = [json!("key"), json!(3)];
    assert_eq!(string_arg(&args, 0, "key").expect("string"), "key");
    assert!(string_arg(&args, 1, "n").is_err());
    assert!(string_arg(&args, 2, "missing").is_err());
  }
}
