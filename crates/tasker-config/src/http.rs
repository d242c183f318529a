use serde::{Deserialize, Serialize};

/// Outbound HTTP service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  /// Per-attempt request timeout.
  pub request_timeout_ms: u64,
  pub retry: RetryConfig,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      request_timeout_ms: 10_000,
      retry: RetryConfig::default(),
    }
  }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  /// Delay before the second attempt.
  pub delay_ms: u64,
  /// Factor applied to the delay after every failed attempt.
  pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      delay_ms: 100,
      backoff_multiplier: 2.0,
    }
  }
}

impl RetryConfig {
  /// Delay to wait after the given (1-based) failed attempt.
  pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
    let factor = self
      .backoff_multiplier
      .powi(attempt.saturating_sub(1) as i32);
    std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
  }
}
