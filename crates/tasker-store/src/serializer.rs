//! Conversion between records and their stored form.
//!
//! Adapters keep structured fields (`input`, `output`, `error`, `metadata`,
//! `resume_payload`, ...) as JSON text and may use their own field names
//! (`created_at`, `task_name`). Everything outside this module sees the
//! canonical camel-case names of the record types.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::Error;
use crate::types::{KeystoreEntry, StackRun, TaskFunction, TaskRun};

/// Canonical names of fields stored as JSON text.
pub const STRUCTURED_FIELDS: &[&str] = &[
  "input",
  "output",
  "error",
  "metadata",
  "resumePayload",
  "operation",
  "value",
];

/// Adapter-native names and the canonical name each maps to.
const FIELD_ALIASES: &[(&str, &str)] = &[
  ("task_identifier", "taskIdentifier"),
  ("task_name", "taskIdentifier"),
  ("taskName", "taskIdentifier"),
  ("task_run_id", "taskRunId"),
  ("parent_stack_run_id", "parentStackRunId"),
  ("call_index", "callIndex"),
  ("resume_payload", "resumePayload"),
  ("claimed_by", "claimedBy"),
  ("claim_expires_at", "claimExpiresAt"),
  ("locked_until", "lockedUntil"),
  ("locked_by", "lockedBy"),
  ("started_at", "startedAt"),
  ("completed_at", "completedAt"),
  ("created_at", "createdAt"),
  ("updated_at", "updatedAt"),
];

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(3)
}

/// RFC 3339 with millisecond precision and a `Z` suffix. Two formatted
/// timestamps compare the same lexically and chronologically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
  DateTime::parse_from_rfc3339(raw)
    .map(|ts| ts.with_timezone(&Utc))
    .map_err(|e| Error::InvalidRecord {
      message: format!("invalid timestamp '{}': {}", raw, e),
    })
}

pub fn encode_field(value: &Value) -> String {
  value.to_string()
}

/// Parse a stored JSON field. Text that is not valid JSON is returned as a
/// plain string rather than failing the read.
pub fn decode_field(raw: &str) -> Value {
  match serde_json::from_str(raw) {
    Ok(value) => value,
    Err(e) => {
      debug!(error = %e, "stored field is not json, passing through");
      Value::String(raw.to_string())
    }
  }
}

pub fn encode_optional(value: Option<&Value>) -> Option<String> {
  value.map(encode_field)
}

/// Map an adapter-native field name to its canonical name. Unknown names
/// are already canonical.
pub fn canonical_field_name(name: &str) -> &str {
  FIELD_ALIASES
    .iter()
    .find(|(alias, _)| *alias == name)
    .map(|(_, canonical)| *canonical)
    .unwrap_or(name)
}

/// Snake-case storage name for a canonical field name.
pub fn storage_field_name(canonical: &str) -> String {
  let mut out = String::with_capacity(canonical.len() + 4);
  for c in canonical.chars() {
    if c.is_ascii_uppercase() {
      out.push('_');
      out.push(c.to_ascii_lowercase());
    } else {
      out.push(c);
    }
  }
  out
}

/// Turn a record into a storable document: snake-case keys, structured
/// fields encoded as JSON text.
pub fn prepare_for_storage<T: Serialize>(record: &T) -> Result<Map<String, Value>, Error> {
  let value = serde_json::to_value(record).map_err(|e| Error::InvalidRecord {
    message: e.to_string(),
  })?;
  let Value::Object(fields) = value else {
    return Err(Error::InvalidRecord {
      message: "record did not serialize to an object".to_string(),
    });
  };

  let mut doc = Map::with_capacity(fields.len());
  for (name, value) in fields {
    let stored = if STRUCTURED_FIELDS.contains(&name.as_str()) && !value.is_null() {
      Value::String(encode_field(&value))
    } else {
      value
    };
    doc.insert(storage_field_name(&name), stored);
  }
  Ok(doc)
}

/// Canonicalize the keys of a stored document and decode its structured
/// fields. Fields with unparsable text pass through as strings.
pub fn load_from_storage(doc: Map<String, Value>) -> Map<String, Value> {
  let mut out = Map::with_capacity(doc.len());
  for (name, value) in doc {
    let canonical = canonical_field_name(&name).to_string();
    let value = match value {
      Value::String(raw) if STRUCTURED_FIELDS.contains(&canonical.as_str()) => decode_field(&raw),
      other => other,
    };
    // A canonical key wins over an alias of it.
    if canonical != name && out.contains_key(&canonical) {
      continue;
    }
    out.insert(canonical, value);
  }
  out
}

pub fn normalize_task_run_record(doc: Map<String, Value>) -> Result<TaskRun, Error> {
  let mut doc = load_from_storage(doc);
  require(&doc, "id")?;
  require(&doc, "taskIdentifier")?;
  fill_default(&mut doc, "status", json!("pending"));
  fill_default(&mut doc, "input", json!({}));
  fill_timestamps(&mut doc);
  from_document(doc)
}

pub fn normalize_stack_run_record(doc: Map<String, Value>) -> Result<StackRun, Error> {
  let mut doc = load_from_storage(doc);
  require(&doc, "id")?;
  require(&doc, "taskRunId")?;
  require(&doc, "operation")?;
  fill_default(&mut doc, "status", json!("pending"));
  fill_default(&mut doc, "callIndex", json!(0));
  let args = doc
    .get("operation")
    .and_then(|op| op.get("args"))
    .cloned()
    .unwrap_or_else(|| json!([]));
  fill_default(&mut doc, "input", args);
  fill_timestamps(&mut doc);
  from_document(doc)
}

pub fn normalize_task_function_record(doc: Map<String, Value>) -> Result<TaskFunction, Error> {
  let mut doc = load_from_storage(doc);
  require(&doc, "name")?;
  let name = doc.get("name").cloned().unwrap_or(Value::Null);
  fill_default(&mut doc, "id", name);
  fill_default(&mut doc, "code", json!(""));
  fill_default(&mut doc, "metadata", json!({}));
  fill_timestamps(&mut doc);
  from_document(doc)
}

pub fn normalize_keystore_record(doc: Map<String, Value>) -> Result<KeystoreEntry, Error> {
  let mut doc = load_from_storage(doc);
  require(&doc, "key")?;
  fill_default(&mut doc, "value", Value::Null);
  fill_default(&mut doc, "metadata", json!({}));
  fill_timestamps(&mut doc);
  from_document(doc)
}

fn require(doc: &Map<String, Value>, field: &str) -> Result<(), Error> {
  match doc.get(field) {
    Some(v) if !v.is_null() => Ok(()),
    _ => Err(Error::InvalidRecord {
      message: format!("missing required field: {}", field),
    }),
  }
}

fn fill_default(doc: &mut Map<String, Value>, field: &str, default: Value) {
  let missing = doc.get(field).is_none_or(Value::is_null);
  if missing {
    doc.insert(field.to_string(), default);
  }
}

fn fill_timestamps(doc: &mut Map<String, Value>) {
  let created = doc
    .get("createdAt")
    .filter(|v| !v.is_null())
    .cloned()
    .unwrap_or_else(|| Value::String(format_timestamp(now())));
  fill_default(doc, "createdAt", created.clone());
  fill_default(doc, "updatedAt", created);
}

fn from_document<T: DeserializeOwned>(doc: Map<String, Value>) -> Result<T, Error> {
  serde_json::from_value(Value::Object(doc)).map_err(|e| Error::InvalidRecord {
    message: e.to_string(),
  })
}
