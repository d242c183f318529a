use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tasker_config::Config;
use tasker_engine::{EngineError, TaskService};
use tasker_host::{KEYSTORE_SERVICE, KeystoreHandler, ServiceRegistry};
use tasker_host_http::{HTTP_SERVICE, HttpHandler};
use tasker_store::{NewTaskFunction, SqliteStore, Store};
use tasker_task_runtime::{NativeRuntime, RuntimeRegistry};
use tasker_task_runtime_lua::LuaRuntime;

/// Tasker - durable task execution with replayed host calls
#[derive(Parser)]
#[command(name = "tasker")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.tasker)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a JSON config file
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Create a pending task run. Input JSON is read from stdin.
  Submit {
    /// Task function name
    task_identifier: String,
  },

  /// Execute or resume a task run
  Execute {
    /// Task run ID
    id: String,
  },

  /// Run one stack processor pass
  Process,

  /// Run stack processor passes until interrupted
  Work {
    /// Delay between passes in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
  },

  /// Show a task run
  Status {
    /// Task run ID
    id: String,

    /// Include the task run's stack runs
    #[arg(long)]
    stack_runs: bool,
  },

  /// Store (or replace) a task function. Code is read from a file or stdin.
  StoreFunction {
    /// Task function name
    name: String,

    /// File holding the task code
    #[arg(long)]
    file: Option<PathBuf>,

    /// Runtime for the code (lua, native)
    #[arg(long)]
    runtime: Option<String>,
  },

  /// Read or write keystore entries
  Keystore {
    #[command(subcommand)]
    action: KeystoreAction,
  },
}

#[derive(Subcommand)]
enum KeystoreAction {
  /// Print a keystore value
  Get { key: String },

  /// Set a keystore value. The JSON value is read from stdin.
  Set { key: String },
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tasker=info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let rt = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(e) => return report(&anyhow::Error::from(e)),
  };

  match rt.block_on(run(cli)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => report(&e),
  }
}

/// Print an error as JSON. Only the code and message are shown.
fn report(err: &anyhow::Error) -> ExitCode {
  let code = err
    .downcast_ref::<EngineError>()
    .map(EngineError::error_code)
    .unwrap_or("CLI_ERROR");
  let body = json!({ "error": { "code": code, "message": format!("{:#}", err) } });
  println!("{}", body);
  ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<()> {
  let Some(command) = cli.command else {
    eprintln!("tasker - use --help to see available commands");
    return Ok(());
  };

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".tasker"),
  };
  let config = load_config(cli.config.as_deref())?;
  let service = open_service(&data_dir, &config).await?;

  let result = dispatch(command, &service, &config).await;
  service.store().close().await;
  result
}

async fn dispatch(command: Commands, service: &TaskService, config: &Config) -> Result<()> {
  match command {
    Commands::Submit { task_identifier } => {
      let input = read_json_from_stdin()?;
      let run = service.submit(&task_identifier, input).await?;
      print_json(&json!({ "taskRunId": run.id }))
    }
    Commands::Execute { id } => {
      let outcome = service.execute(&id).await?;
      print_json(&outcome)
    }
    Commands::Process => {
      let summary = service.process().await?;
      print_json(&summary)
    }
    Commands::Work { interval_ms } => {
      let interval = Duration::from_millis(interval_ms.unwrap_or(config.processor.interval_ms));
      let cancel = CancellationToken::new();
      let stop = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          info!("interrupt received, stopping after the current pass");
          stop.cancel();
        }
      });
      info!(interval_ms = interval.as_millis() as u64, "work mode started");
      service
        .processor()
        .run_until_cancelled(interval, cancel)
        .await;
      Ok(())
    }
    Commands::Status { id, stack_runs } => {
      let run = service.status(&id).await?;
      if stack_runs {
        let stack_runs = service.stack_runs(&id).await?;
        print_json(&json!({ "taskRun": run, "stackRuns": stack_runs }))
      } else {
        print_json(&run)
      }
    }
    Commands::StoreFunction {
      name,
      file,
      runtime,
    } => {
      let code = match file {
        Some(path) => tokio::fs::read_to_string(&path)
          .await
          .with_context(|| format!("failed to read task code: {}", path.display()))?,
        None => read_stdin()?,
      };
      let metadata = match runtime {
        Some(runtime) => json!({ "runtime": runtime }),
        None => json!({}),
      };
      let function = service
        .store_function(NewTaskFunction {
          name,
          code,
          metadata,
        })
        .await?;
      print_json(&json!({ "id": function.id, "name": function.name }))
    }
    Commands::Keystore { action } => match action {
      KeystoreAction::Get { key } => {
        let value = service
          .get_keystore(&key)
          .await?
          .map(|entry| entry.value)
          .unwrap_or(Value::Null);
        print_json(&json!({ "key": key, "value": value }))
      }
      KeystoreAction::Set { key } => {
        let value = read_json_from_stdin()?;
        let entry = service.set_keystore(&key, value, json!({})).await?;
        print_json(&json!({ "key": entry.key }))
      }
    },
  }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
  let Some(path) = path else {
    return Ok(Config::default());
  };
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  Config::from_json(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

async fn open_service(data_dir: &Path, config: &Config) -> Result<TaskService> {
  let database_path = match &config.store.database_path {
    Some(path) => path.clone(),
    None => {
      tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
      data_dir.join("tasker.db")
    }
  };

  let store = SqliteStore::connect(&database_path)
    .await
    .with_context(|| format!("failed to open database: {}", database_path.display()))?;
  store.init().await.context("failed to initialize database")?;
  info!(database = %database_path.display(), "store opened");
  let store: Arc<dyn Store> = Arc::new(store);

  let mut lua = LuaRuntime::new();
  if let Some(limit) = config.lua.memory_limit_bytes {
    lua = lua.with_memory_limit(limit);
  }
  let runtimes = RuntimeRegistry::new(config.default_runtime.clone())
    .with(lua)
    .with(builtin_tasks());
  let services = ServiceRegistry::new()
    .with(KEYSTORE_SERVICE, KeystoreHandler)
    .with(HTTP_SERVICE, HttpHandler::new(config.http.clone()));

  Ok(TaskService::new(store, runtimes, services, config))
}

/// Native tasks shipped with the binary.
fn builtin_tasks() -> NativeRuntime {
  NativeRuntime::new().with("echo", |input, _host| {
    Ok(json!({ "success": true, "data": input }))
  })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn read_stdin() -> Result<String> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(String::new());
  }
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read stdin")?;
  Ok(input)
}

fn read_json_from_stdin() -> Result<Value> {
  let input = read_stdin()?;
  if input.trim().is_empty() {
    Ok(json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse JSON from stdin")
  }
}
