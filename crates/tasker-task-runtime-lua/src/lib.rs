//! Lua runtime for tasker task code.
//!
//! A task function's code is a Lua chunk. The chunk gets the task input as
//! the global `input` (and as its first vararg) and its return value is the
//! task output.
//!
//! Globals available to task code:
//! - `host.call(service, method, ...)`: returns the call result or raises
//! - `host.try_call(service, method, ...)`: returns `true, result` or
//!   `false, { code, message, details }`
//! - `host.task(identifier, input)`: runs another task function
//! - `log.debug/info/warn/error(message)`, and `print`, which logs at info
//!
//! Task code is replayed from the top on every resume, so the sandbox leaves
//! out `io`, `os`, `package`, `debug`, file loading and `math.random`.

use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value as LuaValue, Variadic};
use serde_json::Value;
use tasker_host::{CallError, HostCalls};
use tasker_task_runtime::{TaskFault, TaskRuntime};
use tracing::{debug, error, info, warn};

/// Runtime name used in task function metadata.
pub const LUA_RUNTIME: &str = "lua";

/// Runs task code in a fresh Lua 5.4 state per execution attempt.
#[derive(Debug, Clone, Default)]
pub struct LuaRuntime {
  memory_limit: Option<usize>,
}

impl LuaRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cap the memory a task's Lua state may allocate, in bytes.
  pub fn with_memory_limit(mut self, bytes: usize) -> Self {
    self.memory_limit = Some(bytes);
    self
  }

  fn create_state(&self, host: &HostCalls) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
      StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
      LuaOptions::new(),
    )?;
    if let Some(limit) = self.memory_limit {
      lua.set_memory_limit(limit)?;
    }

    let globals = lua.globals();
    for name in ["dofile", "loadfile"] {
      globals.set(name, LuaValue::Nil)?;
    }
    let math: Table = globals.get("math")?;
    math.set("random", LuaValue::Nil)?;
    math.set("randomseed", LuaValue::Nil)?;

    globals.set("host", host_table(&lua, host)?)?;
    let log = log_table(&lua, host.task_run_id())?;
    globals.set("print", log.get::<mlua::Function>("info")?)?;
    globals.set("log", log)?;

    Ok(lua)
  }
}

impl TaskRuntime for LuaRuntime {
  fn name(&self) -> &str {
    LUA_RUNTIME
  }

  fn run(&self, code: &str, input: Value, host: HostCalls) -> Result<Value, TaskFault> {
    let lua = self.create_state(&host).map_err(into_fault)?;

    let input = lua.to_value(&input).map_err(into_fault)?;
    lua.globals().set("input", input.clone()).map_err(into_fault)?;

    let result: LuaValue = lua
      .load(code)
      .set_name("task")
      .call(input)
      .map_err(into_fault)?;

    lua.from_value(result).map_err(|e| TaskFault::Raised {
      message: format!("task returned a value that is not json: {}", e),
      details: None,
    })
  }
}

fn json_args(lua: &Lua, args: Variadic<LuaValue>) -> mlua::Result<Vec<Value>> {
  args.iter().map(|arg| lua.from_value(arg.clone())).collect()
}

fn host_table(lua: &Lua, host: &HostCalls) -> mlua::Result<Table> {
  let table = lua.create_table()?;

  let h = host.clone();
  table.set(
    "call",
    lua.create_function(
      move |lua, (service, method, args): (String, String, Variadic<LuaValue>)| {
        let args = json_args(lua, args)?;
        match h.call(&service, &method, args) {
          Ok(value) => lua.to_value(&value),
          Err(err) => Err(mlua::Error::external(err)),
        }
      },
    )?,
  )?;

  let h = host.clone();
  table.set(
    "try_call",
    lua.create_function(
      move |lua, (service, method, args): (String, String, Variadic<LuaValue>)| {
        let args = json_args(lua, args)?;
        match h.call(&service, &method, args) {
          Ok(value) => Ok((true, lua.to_value(&value)?)),
          Err(CallError::Failed(payload)) => Ok((false, lua.to_value(&payload.to_value())?)),
          // Suspension and divergence always unwind.
          Err(err) => Err(mlua::Error::external(err)),
        }
      },
    )?,
  )?;

  let h = host.clone();
  table.set(
    "task",
    lua.create_function(
      move |lua, (identifier, input): (String, Option<LuaValue>)| {
        let input = match input {
          Some(value) => lua.from_value(value)?,
          None => Value::Null,
        };
        match h.task(&identifier, input) {
          Ok(value) => lua.to_value(&value),
          Err(err) => Err(mlua::Error::external(err)),
        }
      },
    )?,
  )?;

  Ok(table)
}

fn log_table(lua: &Lua, task_run_id: &str) -> mlua::Result<Table> {
  let table = lua.create_table()?;

  let levels: [(&str, fn(&str, &str)); 4] = [
    ("debug", |id, msg| debug!(task_run_id = %id, message = %msg, "task_log")),
    ("info", |id, msg| info!(task_run_id = %id, message = %msg, "task_log")),
    ("warn", |id, msg| warn!(task_run_id = %id, message = %msg, "task_log")),
    ("error", |id, msg| error!(task_run_id = %id, message = %msg, "task_log")),
  ];
  for (name, emit) in levels {
    let id = task_run_id.to_string();
    table.set(
      name,
      lua.create_function(move |_, parts: Variadic<LuaValue>| {
        let message = parts
          .iter()
          .map(display_value)
          .collect::<Vec<_>>()
          .join(" ");
        emit(&id, &message);
        Ok(())
      })?,
    )?;
  }

  Ok(table)
}

fn display_value(value: &LuaValue) -> String {
  match value {
    LuaValue::String(s) => s.to_string_lossy().to_string(),
    LuaValue::Nil => "nil".to_string(),
    LuaValue::Boolean(b) => b.to_string(),
    LuaValue::Integer(i) => i.to_string(),
    LuaValue::Number(n) => n.to_string(),
    other => format!("<{}>", other.type_name()),
  }
}

/// Host call errors raised inside Lua come back wrapped in callback errors.
fn find_call_error(err: &mlua::Error) -> Option<CallError> {
  match err {
    mlua::Error::ExternalError(inner) => inner.downcast_ref::<CallError>().cloned(),
    mlua::Error::CallbackError { cause, .. } => find_call_error(cause),
    mlua::Error::WithContext { cause, .. } => find_call_error(cause),
    _ => None,
  }
}

fn lua_message(err: &mlua::Error) -> String {
  match err {
    mlua::Error::RuntimeError(message) => message.clone(),
    mlua::Error::SyntaxError { message, .. } => message.clone(),
    mlua::Error::MemoryError(message) => message.clone(),
    mlua::Error::CallbackError { cause, .. } => lua_message(cause),
    mlua::Error::WithContext { cause, .. } => lua_message(cause),
    other => other.to_string(),
  }
}

fn into_fault(err: mlua::Error) -> TaskFault {
  match find_call_error(&err) {
    Some(call_err) => TaskFault::Call(call_err),
    None => TaskFault::raised(lua_message(&err)),
  }
}
