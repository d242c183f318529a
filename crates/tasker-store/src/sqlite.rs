use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};

use crate::serializer::{
  encode_field, encode_optional, format_timestamp, normalize_keystore_record,
  normalize_stack_run_record, normalize_task_function_record, normalize_task_run_record, now,
};
use crate::{
  Error, KeystoreEntry, NewStackRun, NewTaskFunction, NewTaskRun, StackRun, StackRunPatch,
  StackRunResolution, StackRunStatus, Store, TaskFunction, TaskRun, TaskRunPatch, TaskRunStatus,
};

const TASK_RUN_COLUMNS: &str = "id, task_identifier, status, input, output, error, started_at, \
  completed_at, locked_until, locked_by, created_at, updated_at";

const STACK_RUN_COLUMNS: &str = "id, task_run_id, parent_stack_run_id, call_index, operation, \
  status, input, output, error, resume_payload, claimed_by, claim_expires_at, created_at, \
  updated_at, completed_at";

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file.
  pub async fn connect(path: &Path) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
      .max_connections(5)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  async fn fetch_task_run(&self, id: &str) -> Result<Option<TaskRun>, Error> {
    let sql = format!("SELECT {} FROM task_runs WHERE id = ?", TASK_RUN_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
    row
      .map(|row| normalize_task_run_record(row_to_document(&row)))
      .transpose()
  }

  async fn fetch_task_runs(
    &self,
    clause: &str,
    binds: Vec<String>,
    limit: usize,
  ) -> Result<Vec<TaskRun>, Error> {
    let sql = format!("SELECT {} FROM task_runs {} LIMIT ?", TASK_RUN_COLUMNS, clause);
    let mut query = sqlx::query(&sql);
    for bind in binds {
      query = query.bind(bind);
    }
    let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
    rows
      .iter()
      .map(|row| normalize_task_run_record(row_to_document(row)))
      .collect()
  }

  async fn fetch_stack_run(&self, id: &str) -> Result<Option<StackRun>, Error> {
    let sql = format!("SELECT {} FROM stack_runs WHERE id = ?", STACK_RUN_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
    row
      .map(|row| normalize_stack_run_record(row_to_document(&row)))
      .transpose()
  }

  async fn fetch_stack_runs(
    &self,
    clause: &str,
    binds: Vec<String>,
    limit: Option<usize>,
  ) -> Result<Vec<StackRun>, Error> {
    let mut sql = format!("SELECT {} FROM stack_runs {}", STACK_RUN_COLUMNS, clause);
    if limit.is_some() {
      sql.push_str(" LIMIT ?");
    }
    let mut query = sqlx::query(&sql);
    for bind in binds {
      query = query.bind(bind);
    }
    if let Some(limit) = limit {
      query = query.bind(limit as i64);
    }
    let rows = query.fetch_all(&self.pool).await?;
    rows
      .iter()
      .map(|row| normalize_stack_run_record(row_to_document(row)))
      .collect()
  }
}

/// Read every column of a row into a document keyed by column name.
fn row_to_document(row: &SqliteRow) -> Map<String, Value> {
  let mut doc = Map::new();
  for column in row.columns() {
    let index = column.ordinal();
    let value = if let Ok(text) = row.try_get::<Option<String>, _>(index) {
      text.map(Value::String).unwrap_or(Value::Null)
    } else if let Ok(int) = row.try_get::<Option<i64>, _>(index) {
      int.map(Value::from).unwrap_or(Value::Null)
    } else {
      Value::Null
    };
    doc.insert(column.name().to_string(), value);
  }
  doc
}

fn timestamp(ts: Option<DateTime<Utc>>) -> Option<String> {
  ts.map(format_timestamp)
}

fn object_or_empty(value: Value) -> Value {
  if value.is_null() { json!({}) } else { value }
}

#[async_trait]
impl Store for SqliteStore {
  async fn init(&self) -> Result<(), Error> {
    self.migrate().await?;
    Ok(())
  }

  async fn close(&self) {
    self.pool.close().await;
  }

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

    sqlx::query(
      r#"
      INSERT INTO task_runs (id, task_identifier, status, input, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.id)
    .bind(&run.task_identifier)
    .bind(run.status.as_str())
    .bind(encode_field(&run.input))
    .bind(format_timestamp(run.created_at))
    .bind(format_timestamp(run.updated_at))
    .execute(&self.pool)
    .await?;

    Ok(run)
  }

  async fn get_task_run(&self, id: &str) -> Result<Option<TaskRun>, Error> {
    self.fetch_task_run(id).await
  }

  async fn update_task_run(&self, id: &str, patch: TaskRunPatch) -> Result<TaskRun, Error> {
    let mut run = self
      .fetch_task_run(id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("task run {}", id)))?;
    if run.is_terminal() {
      return Err(Error::TerminalState {
        id: id.to_string(),
        status: run.status,
      });
    }

    patch.apply(&mut run, now());

    let result = sqlx::query(
      r#"
      UPDATE task_runs
      SET status = ?, output = ?, error = ?, started_at = ?, completed_at = ?,
          locked_until = ?, locked_by = ?, updated_at = ?
      WHERE id = ? AND status NOT IN ('completed', 'failed')
      "#,
    )
    .bind(run.status.as_str())
    .bind(encode_optional(run.output.as_ref()))
    .bind(encode_optional(run.error.as_ref()))
    .bind(timestamp(run.started_at))
    .bind(timestamp(run.completed_at))
    .bind(timestamp(run.locked_until))
    .bind(&run.locked_by)
    .bind(format_timestamp(run.updated_at))
    .bind(id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      // Reached a terminal state between the read and the write.
      let status = self
        .fetch_task_run(id)
        .await?
        .map(|r| r.status)
        .unwrap_or(TaskRunStatus::Completed);
      return Err(Error::TerminalState {
        id: id.to_string(),
        status,
      });
    }

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
    let status_clause = if from.is_empty() {
      "0".to_string()
    } else {
      format!("status IN ({})", vec!["?"; from.len()].join(", "))
    };
    let sql = format!(
      r#"
      UPDATE task_runs
      SET status = 'running', locked_until = ?, locked_by = ?,
          started_at = COALESCE(started_at, ?), updated_at = ?
      WHERE id = ?
        AND ({} OR (status = 'running' AND locked_until IS NOT NULL AND locked_until < ?))
      "#,
      status_clause
    );

    let now = format_timestamp(now);
    let mut query = sqlx::query(&sql)
      .bind(format_timestamp(lease_until))
      .bind(owner)
      .bind(now.clone())
      .bind(now.clone())
      .bind(id);
    for status in from {
      query = query.bind(status.as_str());
    }
    let result = query.bind(now).execute(&self.pool).await?;

    Ok(result.rows_affected() == 1)
  }

  async fn release_task_run(
    &self,
    id: &str,
    owner: &str,
    patch: TaskRunPatch,
  ) -> Result<bool, Error> {
    let Some(mut run) = self.fetch_task_run(id).await? else {
      return Ok(false);
    };
    if run.status != TaskRunStatus::Running || run.locked_by.as_deref() != Some(owner) {
      return Ok(false);
    }

    patch.apply(&mut run, now());
    run.locked_until = None;
    run.locked_by = None;

    let result = sqlx::query(
      r#"
      UPDATE task_runs
      SET status = ?, output = ?, error = ?, completed_at = ?, locked_until = NULL,
          locked_by = NULL, updated_at = ?
      WHERE id = ? AND status = 'running' AND locked_by = ?
      "#,
    )
    .bind(run.status.as_str())
    .bind(encode_optional(run.output.as_ref()))
    .bind(encode_optional(run.error.as_ref()))
    .bind(timestamp(run.completed_at))
    .bind(format_timestamp(run.updated_at))
    .bind(id)
    .bind(owner)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn list_resumable_task_runs(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<TaskRun>, Error> {
    self
      .fetch_task_runs(
        "WHERE (status = 'suspended_waiting_child' AND NOT EXISTS ( \
           SELECT 1 FROM stack_runs s \
           WHERE s.task_run_id = task_runs.id AND s.parent_stack_run_id IS NULL \
             AND s.status NOT IN ('completed', 'failed'))) \
         OR (status = 'running' AND locked_until IS NOT NULL AND locked_until < ?) \
         ORDER BY updated_at",
        vec![format_timestamp(now)],
        limit,
      )
      .await
  }

  async fn store_task_function(&self, function: NewTaskFunction) -> Result<TaskFunction, Error> {
    function.validate()?;
    let ts = format_timestamp(now());

    sqlx::query(
      r#"
      INSERT INTO task_functions (id, name, code, metadata, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?)
      ON CONFLICT(name) DO UPDATE SET
        code = excluded.code,
        metadata = excluded.metadata,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&function.name)
    .bind(&function.code)
    .bind(encode_field(&object_or_empty(function.metadata)))
    .bind(&ts)
    .bind(&ts)
    .execute(&self.pool)
    .await?;

    self
      .get_task_function(&function.name)
      .await?
      .ok_or_else(|| Error::NotFound(format!("task function {}", function.name)))
  }

  async fn get_task_function(&self, name: &str) -> Result<Option<TaskFunction>, Error> {
    let row = sqlx::query(
      r#"
      SELECT id, name, code, metadata, created_at, updated_at
      FROM task_functions
      WHERE name = ?
      "#,
    )
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(|row| normalize_task_function_record(row_to_document(&row)))
      .transpose()
  }

  async fn create_stack_run(&self, new: NewStackRun) -> Result<StackRun, Error> {
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
    let operation = serde_json::to_value(&run.operation).map_err(|e| Error::InvalidRecord {
      message: e.to_string(),
    })?;

    sqlx::query(
      r#"
      INSERT INTO stack_runs (id, task_run_id, parent_stack_run_id, call_index, operation, status,
                              input, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.id)
    .bind(&run.task_run_id)
    .bind(&run.parent_stack_run_id)
    .bind(run.call_index as i64)
    .bind(encode_field(&operation))
    .bind(run.status.as_str())
    .bind(encode_field(&run.input))
    .bind(format_timestamp(run.created_at))
    .bind(format_timestamp(run.updated_at))
    .execute(&self.pool)
    .await?;

    Ok(run)
  }

  async fn get_stack_run(&self, id: &str) -> Result<Option<StackRun>, Error> {
    self.fetch_stack_run(id).await
  }

  async fn update_stack_run(&self, id: &str, patch: StackRunPatch) -> Result<StackRun, Error> {
    let mut run = self
      .fetch_stack_run(id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("stack run {}", id)))?;
    let sets_result = patch.sets_result();
    if sets_result && (run.is_resolved() || run.output.is_some() || run.error.is_some()) {
      return Err(Error::ResultAlreadySet(id.to_string()));
    }

    patch.apply(&mut run, now());

    let result = sqlx::query(
      r#"
      UPDATE stack_runs
      SET status = ?, output = ?, error = ?, resume_payload = ?, claimed_by = ?,
          claim_expires_at = ?, completed_at = ?, updated_at = ?
      WHERE id = ? AND (? = 0 OR (output IS NULL AND error IS NULL))
      "#,
    )
    .bind(run.status.as_str())
    .bind(encode_optional(run.output.as_ref()))
    .bind(encode_optional(run.error.as_ref()))
    .bind(encode_optional(run.resume_payload.as_ref()))
    .bind(&run.claimed_by)
    .bind(timestamp(run.claim_expires_at))
    .bind(timestamp(run.completed_at))
    .bind(format_timestamp(run.updated_at))
    .bind(id)
    .bind(sets_result)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::ResultAlreadySet(id.to_string()));
    }

    Ok(run)
  }

  async fn list_stack_runs(&self, task_run_id: &str) -> Result<Vec<StackRun>, Error> {
    self
      .fetch_stack_runs(
        "WHERE task_run_id = ? ORDER BY call_index, created_at",
        vec![task_run_id.to_string()],
        None,
      )
      .await
  }

  async fn list_pending_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error> {
    self
      .fetch_stack_runs(
        "WHERE status = 'pending' ORDER BY created_at, call_index",
        Vec::new(),
        Some(limit),
      )
      .await
  }

  async fn list_expired_claims(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<StackRun>, Error> {
    self
      .fetch_stack_runs(
        "WHERE status = 'running' AND claim_expires_at IS NOT NULL AND claim_expires_at < ? \
         ORDER BY claim_expires_at",
        vec![format_timestamp(now)],
        Some(limit),
      )
      .await
  }

  async fn list_wakeable_stack_runs(&self, limit: usize) -> Result<Vec<StackRun>, Error> {
    self
      .fetch_stack_runs(
        "WHERE status = 'suspended_waiting_child' \
         AND EXISTS (SELECT 1 FROM stack_runs c WHERE c.parent_stack_run_id = stack_runs.id) \
         AND NOT EXISTS ( \
           SELECT 1 FROM stack_runs c \
           WHERE c.parent_stack_run_id = stack_runs.id AND c.status NOT IN ('completed', 'failed')) \
         ORDER BY updated_at",
        Vec::new(),
        Some(limit),
      )
      .await
  }

  async fn claim_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
    claim_expires_at: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let now = format_timestamp(now);
    let result = sqlx::query(
      r#"
      UPDATE stack_runs
      SET status = 'running', claimed_by = ?, claim_expires_at = ?, updated_at = ?
      WHERE id = ?
        AND output IS NULL AND error IS NULL
        AND (status = 'pending'
             OR (status = 'running' AND claim_expires_at IS NOT NULL AND claim_expires_at < ?))
      "#,
    )
    .bind(worker_id)
    .bind(format_timestamp(claim_expires_at))
    .bind(&now)
    .bind(id)
    .bind(&now)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn resolve_stack_run(
    &self,
    id: &str,
    worker_id: &str,
    resolution: StackRunResolution,
  ) -> Result<bool, Error> {
    let ts = format_timestamp(now());
    let result = sqlx::query(
      r#"
      UPDATE stack_runs
      SET status = ?, output = ?, error = ?, claimed_by = NULL, claim_expires_at = NULL,
          completed_at = ?, updated_at = ?
      WHERE id = ? AND status = 'running' AND claimed_by = ?
        AND output IS NULL AND error IS NULL
      "#,
    )
    .bind(resolution.status().as_str())
    .bind(encode_optional(resolution.output()))
    .bind(encode_optional(resolution.error()))
    .bind(&ts)
    .bind(&ts)
    .bind(id)
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn wake_stack_run(&self, id: &str, resume_payload: Value) -> Result<bool, Error> {
    let result = sqlx::query(
      r#"
      UPDATE stack_runs
      SET status = 'pending', resume_payload = ?, updated_at = ?
      WHERE id = ? AND status = 'suspended_waiting_child'
      "#,
    )
    .bind(encode_field(&resume_payload))
    .bind(format_timestamp(now()))
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn get_keystore(&self, key: &str) -> Result<Option<KeystoreEntry>, Error> {
    let row = sqlx::query(
      r#"
      SELECT key, value, metadata, created_at, updated_at
      FROM keystore
      WHERE key = ?
      "#,
    )
    .bind(key)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(|row| normalize_keystore_record(row_to_document(&row)))
      .transpose()
  }

  async fn set_keystore(
    &self,
    key: &str,
    value: Value,
    metadata: Value,
  ) -> Result<KeystoreEntry, Error> {
    let ts = format_timestamp(now());

    sqlx::query(
      r#"
      INSERT INTO keystore (key, value, metadata, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        metadata = excluded.metadata,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(key)
    .bind(encode_field(&value))
    .bind(encode_field(&object_or_empty(metadata)))
    .bind(&ts)
    .bind(&ts)
    .execute(&self.pool)
    .await?;

    self
      .get_keystore(key)
      .await?
      .ok_or_else(|| Error::NotFound(format!("keystore entry {}", key)))
  }
}
