use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::serializer::{
  normalize_keystore_record, normalize_stack_run_record, normalize_task_function_record,
  normalize_task_run_record, now, prepare_for_storage,
};
use crate::{
  Error, KeystoreEntry, NewStackRun, NewTaskFunction, NewTaskRun, StackRun, StackRunPatch,
  StackRunResolution, StackRunStatus, Store, TaskFunction, TaskRun, TaskRunPatch, TaskRunStatus,
};

type Document = Map<String, Value>;

#[derive(Default)]
struct Collections {
  task_runs: HashMap<String, Document>,
  stack_runs: HashMap<String, Document>,
  /// Keyed by function name.
  task_functions: HashMap<String, Document>,
  keystore: HashMap<String, Document>,
}

/// In-process store that keeps every record as a serialized document, the
/// way a hosted document database would.
///
/// Each operation runs under one lock, so claims are atomic across tasks
/// sharing the store. Suitable for tests and single-process use.
#[derive(Default)]
pub struct MemoryStore {
  collections: Mutex<Collections>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Collections> {
    self.collections.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn load_task_run(docs: &HashMap<String, Document>, id: &str) -> Result<Option<TaskRun>, Error> {
  docs
    .get(id)
    .map(|doc| normalize_task_run_record(doc.clone()))
    .transpose()
}

fn load_stack_run(docs: &HashMap<String, Document>, id: &str) -> Result<Option<StackRun>, Error> {
  docs
    .get(id)
    .map(|doc| normalize_stack_run_record(doc.clone()))
    .transpose()
}

fn load_stack_runs<F>(docs: &HashMap<String, Document>, filter: F) -> Result<Vec<StackRun>, Error>
where
  F: Fn(&StackRun) -> bool,
{
  let mut runs = Vec::new();
  for doc in docs.values() {
    let run = normalize_stack_run_record(doc.clone())?;
    if filter(&run) {
      runs.push(run);
    }
  }
  Ok(runs)
}

fn claim_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  expires_at.is_some_and(|ts| ts < now)
}

fn object_or_empty(value: Value) -> Value {
  if value.is_null() { json!({}) } else { value }
}

#[async_trait]
impl Store for MemoryStore {
  async fn init(&self) -> Result<(), Error> {
    Ok(())
  }

  async fn close(&self) {}

  async fn create_task_run(&self, new: NewTaskRun) -> Result<TaskRun, Error> {
    new.validate()?;
    let ts = now();
    let run = TaskRun {
      id: uuid::Uuid::new_v4().to_string(),
      task_identifier: new.task_identifier,
      status: TaskRunStatus::Pending,
      input: new.input,
      output: None,
      error: None,
      started_at: None,
      completed_at: None,
      locked_until: None,
      locked_by: None,
      created_at: ts,
      updated_at: ts,
    };
    let doc = prepare_for_storage(&run)?;
    self.lock().task_runs.insert(run.id.clone(), doc);
    Ok(run)
  }

  async fn get_task_run(&self, id: &str) -> Result<Option<TaskRun>, Error> {
    load_task_run(&self.lock().task_runs, id)
  }

  async fn update_task_run(&self, id: &str, patch: TaskRunPatch) -> Result<TaskRun, Error> {
    let mut collections = self.lock();
    let mut run = load_task_run(&collections.task_runs, id)?
      .ok_or_else(|| Error::NotFound(format!("task run {}", id)))?;
    if run.is_terminal() {
      return Err(Error::TerminalState {
        id: id.to_string(),
        status: run.status,
      });
    }
    patch.apply(&mut run, now());
    collections
      .task_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(run)
  }

  async fn claim_task_run(
    &self,
    id: &str,
    from: &[TaskRunStatus],
    owner: &str,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut collections = self.lock();
    let Some(mut run) = load_task_run(&collections.task_runs, id)? else {
      return Ok(false);
    };
    let claimable = from.contains(&run.status)
      || (run.status == TaskRunStatus::Running && claim_expired(run.locked_until, now));
    if !claimable {
      return Ok(false);
    }

    run.status = TaskRunStatus::Running;
    run.locked_until = Some(lease_until);
    run.locked_by = Some(owner.to_string());
    run.started_at = run.started_at.or(Some(now));
    run.updated_at = now;
    collections
      .task_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(true)
  }

  async fn release_task_run(
    &self,
    id: &str,
    owner: &str,
    patch: TaskRunPatch,
  ) -> Result<bool, Error> {
    let mut collections = self.lock();
    let Some(mut run) = load_task_run(&collections.task_runs, id)? else {
      return Ok(false);
    };
    if run.status != TaskRunStatus::Running || run.locked_by.as_deref() != Some(owner) {
      return Ok(false);
    }

    patch.apply(&mut run, now());
    run.locked_until = None;
    run.locked_by = None;
    collections
      .task_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(true)
  }

  async fn list_resumable_task_runs(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<TaskRun>, Error> {
    let collections = self.lock();
    let mut runs = Vec::new();
    for doc in collections.task_runs.values() {
      let run = normalize_task_run_record(doc.clone())?;
      let resumable = match run.status {
        TaskRunStatus::SuspendedWaitingChild => load_stack_runs(&collections.stack_runs, |s| {
          s.task_run_id == run.id && s.parent_stack_run_id.is_none() && !s.is_resolved()
        })?
        .is_empty(),
        TaskRunStatus::Running => claim_expired(run.locked_until, now),
        _ => false,
      };
      if resumable {
        runs.push(run);
      }
    }
    runs.sort_by_key(|run| run.updated_at);
    runs.truncate(limit);
    Ok(runs)
  }

  async fn store_task_function(&self, function: NewTaskFunction) -> Result<TaskFunction, Error> {
    function.validate()?;
    let mut collections = self.lock();
    let ts = now();
    let existing = collections
      .task_functions
      .get(&function.name)
      .map(|doc| normalize_task_function_record(doc.clone()))
      .transpose()?;

    let stored = TaskFunction {
      id: existing
        .as_ref()
        .map(|f| f.id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
      name: function.name,
      code: function.code,
      metadata: object_or_empty(function.metadata),
      created_at: existing.as_ref().map(|f| f.created_at).unwrap_or(ts),
      updated_at: ts,
    };
    collections
      .task_functions
      .insert(stored.name.clone(), prepare_for_storage(&stored)?);
    Ok(stored)
  }

  async fn get_task_function(&self, name: &str) -> Result<Option<TaskFunction>, Error> {
    self
      .lock()
      .task_functions
      .get(name)
      .map(|doc| normalize_task_function_record(doc.clone()))
      .transpose()
  }

  async fn create_stack_run(&self, new: NewStackRun) -> Result<StackRun, Error> {
    let mut collections = self.lock();
    if !collections.task_runs.contains_key(&new.task_run_id) {
      return Err(Error::NotFound(format!("task run {}", new.task_run_id)));
    }
    if let Some(parent) = &new.parent_stack_run_id {
      if !collections.stack_runs.contains_key(parent) {
        return Err(Error::NotFound(format!("stack run {}", parent)));
      }
    }
    let duplicate = load_stack_runs(&collections.stack_runs, |run| {
      run.task_run_id == new.task_run_id
        && run.parent_stack_run_id == new.parent_stack_run_id
        && run.call_index == new.call_index
    })?;
    if !duplicate.is_empty() {
      return Err(Error::InvalidRecord {
        message: format!(
          "stack run already exists at call index {} of task run {}",
          new.call_index, new.task_run_id
        ),
      });
    }

    let ts = now();
    let run = StackRun {
      id: uuid::Uuid::new_v4().to_string(),
      task_run_id: new.task_run_id,
      parent_stack_run_id: new.parent_stack_run_id,
      call_index: new.call_index,
      input: Value::Array(new.operation.args.clone()),
      operation: new.operation,
      status: StackRunStatus::Pending,
      output: None,
      error: None,
      resume_payload: None,
      claimed_by: None,
      claim_expires_at: None,
      created_at: ts,
      updated_at: ts,
      completed_at: None,
    };
    collections
      .stack_runs
      .insert(run.id.clone(), prepare_for_storage(&run)?);
    Ok(run)
  }

  async fn get_stack_run(&self, id: &str) -> Result<Option<StackRun>, Error> {
    load_stack_run(&self.lock().stack_runs, id)
  }

  async fn update_stack_run(&self, id: &str, patch: StackRunPatch) -> Result<StackRun, Error> {
    let mut collections = self.lock();
    let mut run = load_stack_run(&collections.stack_runs, id)?
      .ok_or_else(|| Error::NotFound(format!("stack run {}", id)))?;
    if patch.sets_result() && (run.is_resolved() || run.output.is_some() || run.error.is_some()) {
      return Err(Error::ResultAlreadySet(id.to_string()));
    }
    patch.apply(&mut run, now());
    collections
      .stack_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(run)
  }

  async fn list_stack_runs(&self, task_run_id: &str) -> Result<Vec<StackRun>, Error> {
    let mut runs = load_stack_runs(&self.lock().stack_runs, |run| {
      run.task_run_id == task_run_id
    })?;
    runs.sort_by(|a, b| {
      a.call_index
        .cmp(&b.call_index)
        .then(a.created_at.cmp(&b.created_at))
    });
    Ok(runs)
  }

  async fn list_pending_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error> {
    let mut runs = load_stack_runs(&self.lock().stack_runs, |run| {
      run.status == StackRunStatus::Pending
    })?;
    runs.sort_by(|a, b| {
      a.created_at
        .cmp(&b.created_at)
        .then(a.call_index.cmp(&b.call_index))
    });
    runs.truncate(limit);
    Ok(runs)
  }

  async fn list_expired_claims(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<StackRun>, Error> {
    let mut runs = load_stack_runs(&self.lock().stack_runs, |run| {
      run.status == StackRunStatus::Running && claim_expired(run.claim_expires_at, now)
    })?;
    runs.sort_by_key(|run| run.claim_expires_at);
    runs.truncate(limit);
    Ok(runs)
  }

  async fn list_wakeable_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error> {
    let collections = self.lock();
    let all = load_stack_runs(&collections.stack_runs, |_| true)?;
    let mut runs: Vec<StackRun> = all
      .iter()
      .filter(|run| run.status == StackRunStatus::SuspendedWaitingChild)
      .filter(|run| {
        let mut children = all
          .iter()
          .filter(|child| child.parent_stack_run_id.as_deref() == Some(run.id.as_str()))
          .peekable();
        children.peek().is_some() && children.all(StackRun::is_resolved)
      })
      .cloned()
      .collect();
    runs.sort_by_key(|run| run.updated_at);
    runs.truncate(limit);
    Ok(runs)
  }

  async fn claim_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    claim_expires_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut collections = self.lock();
    let Some(mut run) = load_stack_run(&collections.stack_runs, id)? else {
      return Ok(false);
    };
    let claimable = run.output.is_none()
      && run.error.is_none()
      && (run.status == StackRunStatus::Pending
        || (run.status == StackRunStatus::Running && claim_expired(run.claim_expires_at, now)));
    if !claimable {
      return Ok(false);
    }

    run.status = StackRunStatus::Running;
    run.claimed_by = Some(worker_id.to_string());
    run.claim_expires_at = Some(claim_expires_at);
    run.updated_at = now;
    collections
      .stack_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(true)
  }

  async fn resolve_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    resolution: StackRunResolution,
  ) -> Result<bool, Error> {
    let mut collections = self.lock();
    let Some(mut run) = load_stack_run(&collections.stack_runs, id)? else {
      return Ok(false);
    };
    let owned = run.status == StackRunStatus::Running
      && run.claimed_by.as_deref() == Some(worker_id)
      && run.output.is_none()
      && run.error.is_none();
    if !owned {
      return Ok(false);
    }

    let ts = now();
    run.status = resolution.status();
    run.output = resolution.output().cloned();
    run.error = resolution.error().cloned();
    run.claimed_by = None;
    run.claim_expires_at = None;
    run.completed_at = Some(ts);
    run.updated_at = ts;
    collections
      .stack_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(true)
  }

  async fn wake_stack_run(&self, id: &str, resume_payload: Value) -> Result<bool, Error> {
    let mut collections = self.lock();
    let Some(mut run) = load_stack_run(&collections.stack_runs, id)? else {
      return Ok(false);
    };
    if run.status != StackRunStatus::SuspendedWaitingChild {
      return Ok(false);
    }

    run.status = StackRunStatus::Pending;
    run.resume_payload = Some(resume_payload);
    run.updated_at = now();
    collections
      .stack_runs
      .insert(id.to_string(), prepare_for_storage(&run)?);
    Ok(true)
  }

  async fn get_keystore(&self, key: &str) -> Result<Option<KeystoreEntry>, Error> {
    self
      .lock()
      .keystore
      .get(key)
      .map(|doc| normalize_keystore_record(doc.clone()))
      .transpose()
  }

  async fn set_keystore(
    &self,
    key: &str,
    value: Value,
    metadata: Value,
  ) -> Result<KeystoreEntry, Error> {
    let mut collections = self.lock();
    let ts = now();
    let created_at = collections
      .keystore
      .get(key)
      .map(|doc| normalize_keystore_record(doc.clone()))
      .transpose()?
      .map(|entry| entry.created_at)
      .unwrap_or(ts);

    let entry = KeystoreEntry {
      key: key.to_string(),
      value,
      metadata: object_or_empty(metadata),
      created_at,
      updated_at: ts,
    };
    collections
      .keystore
      .insert(key.to_string(), prepare_for_storage(&entry)?);
    Ok(entry)
  }
}
