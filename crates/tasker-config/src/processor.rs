use serde::{Deserialize, Serialize};

/// Stack processor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
  /// Identity written into stack run claims. Generated when absent.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
  /// Upper bound for a single external call.
  pub call_timeout_ms: u64,
  /// How long a stack run claim is honoured before it may be reclaimed.
  pub lock_timeout_ms: u64,
  /// Maximum number of stack runs picked up per pass.
  pub batch_size: usize,
  /// Delay between passes in `work` mode.
  pub interval_ms: u64,
}

impl Default for ProcessorConfig {
  fn default() -> Self {
    Self {
      worker_id: None,
      call_timeout_ms: 30_000,
      lock_timeout_ms: 60_000,
      batch_size: 50,
      interval_ms: 1_000,
    }
  }
}

impl ProcessorConfig {
  /// The configured worker id, or a fresh `worker-<uuid>`.
  pub fn worker_id(&self) -> String {
    self
      .worker_id
      .clone()
      .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generated_worker_ids_are_unique() {
    let config = ProcessorConfig::default();
    let a = config.worker_id();
    let b = config.worker_id();
    assert!(a.starts_with("worker-"));
    assert_ne!(a, b);
  }

  #[test]
  fn test_configured_worker_id_is_kept() {
    let config = ProcessorConfig {
      worker_id: Some("w1".to_string()),
      ..Default::default()
    };
    assert_eq!(config.worker_id(), "w1");
  }
}
