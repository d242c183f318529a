//! Errors seen by task code and by service handlers.

use serde_json::Value;
use tasker_store::{ErrorPayload, error_codes};

/// Outcome of a host call that did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
  /// The call has no result yet. Task code must stop; it is replayed once
  /// the call resolves.
  #[error("execution suspended at {call}")]
  Suspended { call: String },

  /// The memoized call failed.
  #[error("{0}")]
  Failed(ErrorPayload),

  /// Replay issued a different call than the one recorded at this position.
  #[error("non-deterministic replay at call {call_index}: expected {expected}, got {actual}")]
  Diverged {
    call_index: u32,
    expected: String,
    actual: String,
  },
}

impl CallError {
  pub fn is_suspended(&self) -> bool {
    matches!(self, Self::Suspended { .. })
  }

  pub fn to_payload(&self) -> ErrorPayload {
    match self {
      Self::Suspended { call } => ErrorPayload::new(
        error_codes::EXECUTION_ERROR,
        format!("execution suspended at {}", call),
      ),
      Self::Failed(payload) => payload.clone(),
      Self::Diverged { .. } => {
        ErrorPayload::new(error_codes::NON_DETERMINISTIC_REPLAY, self.to_string())
      }
    }
  }
}

/// Errors returned by service handlers while performing a call.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  /// The service has no such method.
  #[error("unknown method '{method}' on service '{service}'")]
  UnknownMethod { service: String, method: String },

  /// Arguments were missing or had the wrong shape.
  #[error("invalid arguments: {message}")]
  InvalidArguments { message: String },

  /// The external call ran and failed.
  #[error("{message}")]
  Failed {
    message: String,
    details: Option<Value>,
  },

  /// Reading or writing a record failed.
  #[error("store error: {0}")]
  Store(#[from] tasker_store::Error),
}

impl ServiceError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
      details: None,
    }
  }

  /// Payload stored on the stack run.
  pub fn to_payload(&self) -> ErrorPayload {
    let payload = ErrorPayload::new(error_codes::STACK_CALL_ERROR, self.to_string());
    match self {
      Self::Failed {
        details: Some(details),
        ..
      } => payload.with_details(details.clone()),
      _ => payload,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_divergence_payload_code() {
    let err = CallError::Diverged {
      call_index: 1,
      expected: "http.get".to_string(),
      actual: "http.post".to_string(),
    };
    let payload = err.to_payload();
    assert_eq!(payload.code, error_codes::NON_DETERMINISTIC_REPLAY);
    assert!(payload.message.contains("expected http.get"));
  }

  #[test]
  fn test_service_failure_keeps_details() {
    let err = ServiceError::Failed {
      message: "status 503".to_string(),
      details: Some(json!({"status": 503})),
    };
    let payload = err.to_payload();
    assert_eq!(payload.code, error_codes::STACK_CALL_ERROR);
    assert_eq!(payload.details, Some(json!({"status": 503})));
  }
}
