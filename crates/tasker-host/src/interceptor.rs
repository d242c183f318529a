//! Replay interceptor.
//!
//! Task code never performs external calls itself. Each call goes through
//! an [`Interceptor`] seeded with the stack runs already recorded for the
//! current scope. Calls are numbered in issue order; the number is the
//! call-site position used to find the memoized result on replay.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tasker_store::{CallDescriptor, ErrorPayload, StackRun, StackRunResolution};
use tracing::debug;

use crate::error::CallError;

/// Service name reserved for nested task calls.
pub const TASK_SERVICE: &str = "task";

/// Where execution stopped because a call has no result yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
  /// No stack run exists at this call site. One must be created.
  New {
    call_index: u32,
    operation: CallDescriptor,
  },
  /// A stack run exists but is unresolved.
  Existing {
    stack_run_id: String,
    call_index: u32,
    operation: CallDescriptor,
  },
}

impl Suspension {
  pub fn call_index(&self) -> u32 {
    match self {
      Self::New { call_index, .. } | Self::Existing { call_index, .. } => *call_index,
    }
  }

  pub fn operation(&self) -> &CallDescriptor {
    match self {
      Self::New { operation, .. } | Self::Existing { operation, .. } => operation,
    }
  }
}

/// Why the interceptor stopped answering calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
  Suspended(Suspension),
  Diverged(CallError),
}

impl Halt {
  fn to_call_error(&self) -> CallError {
    match self {
      Self::Suspended(suspension) => CallError::Suspended {
        call: suspension.operation().to_string(),
      },
      Self::Diverged(err) => err.clone(),
    }
  }
}

/// Memoizing call boundary for one execution attempt of one scope.
///
/// A scope is a task run's top level (`parent_stack_run_id = None`) or the
/// body of a nested task call.
#[derive(Debug)]
pub struct Interceptor {
  task_run_id: String,
  parent_stack_run_id: Option<String>,
  history: BTreeMap<u32, StackRun>,
  next_index: u32,
  issued: Vec<CallDescriptor>,
  halt: Option<Halt>,
}

impl Interceptor {
  /// Create an interceptor for a scope. Stack runs outside the scope are
  /// ignored, so the full list of a task run's stack runs may be passed.
  pub fn new(
    task_run_id: impl Into<String>,
    parent_stack_run_id: Option<String>,
    history: impl IntoIterator<Item = StackRun>,
  ) -> Self {
    let task_run_id = task_run_id.into();
    let history = history
      .into_iter()
      .filter(|run| run.task_run_id == task_run_id && run.parent_stack_run_id == parent_stack_run_id)
      .map(|run| (run.call_index, run))
      .collect();

    Self {
      task_run_id,
      parent_stack_run_id,
      history,
      next_index: 0,
      issued: Vec::new(),
      halt: None,
    }
  }

  pub fn task_run_id(&self) -> &str {
    &self.task_run_id
  }

  /// Resolve a call against history.
  ///
  /// Once a call has suspended or diverged, every later call in the same
  /// attempt returns that same error without being recorded.
  pub fn intercept(&mut self, call: CallDescriptor) -> Result<Value, CallError> {
    if let Some(halt) = &self.halt {
      return Err(halt.to_call_error());
    }

    let call_index = self.next_index;
    self.next_index += 1;
    self.issued.push(call.clone());

    let Some(recorded) = self.history.get(&call_index) else {
      debug!(call_index, call = %call, "call_unmemoized");
      return Err(self.stop(Halt::Suspended(Suspension::New {
        call_index,
        operation: call,
      })));
    };

    if recorded.operation != call {
      let err = CallError::Diverged {
        call_index,
        expected: describe(&recorded.operation),
        actual: describe(&call),
      };
      return Err(self.stop(Halt::Diverged(err)));
    }

    match recorded.resolution() {
      Some(StackRunResolution::Completed(value)) => Ok(value),
      Some(StackRunResolution::Failed(error)) => {
        Err(CallError::Failed(ErrorPayload::from_value(&error)))
      }
      None => {
        let stack_run_id = recorded.id.clone();
        Err(self.stop(Halt::Suspended(Suspension::Existing {
          stack_run_id,
          call_index,
          operation: call,
        })))
      }
    }
  }

  fn stop(&mut self, halt: Halt) -> CallError {
    let err = halt.to_call_error();
    self.halt = Some(halt);
    err
  }

  /// Calls issued so far, in order, including the one that halted.
  pub fn issued(&self) -> &[CallDescriptor] {
    &self.issued
  }

  pub fn halt(&self) -> Option<&Halt> {
    self.halt.as_ref()
  }
}

fn describe(call: &CallDescriptor) -> String {
  format!("{}({})", call, Value::Array(call.args.clone()))
}

/// Shared handle to an [`Interceptor`], given to task code.
///
/// Cloning is cheap; all clones feed the same interceptor.
#[derive(Debug, Clone)]
pub struct HostCalls {
  inner: Arc<Mutex<Interceptor>>,
  task_run_id: Arc<str>,
}

impl HostCalls {
  pub fn new(interceptor: Interceptor) -> Self {
    let task_run_id = Arc::from(interceptor.task_run_id());
    Self {
      inner: Arc::new(Mutex::new(interceptor)),
      task_run_id,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Interceptor> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn task_run_id(&self) -> &str {
    &self.task_run_id
  }

  /// Call `method` on `service`.
  pub fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
    self
      .lock()
      .intercept(CallDescriptor::new(service, method, args))
  }

  /// Run another stored task function and return its output.
  pub fn task(&self, identifier: &str, input: Value) -> Result<Value, CallError> {
    self.call(TASK_SERVICE, identifier, vec![input])
  }

  /// Calls issued so far.
  pub fn issued(&self) -> Vec<CallDescriptor> {
    self.lock().issued().to_vec()
  }

  /// Why execution stopped, if it did.
  pub fn halt(&self) -> Option<Halt> {
    self.lock().halt().cloned()
  }
}
