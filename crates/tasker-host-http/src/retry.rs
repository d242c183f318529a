//! Retry with exponential backoff.

use std::future::Future;

use tasker_config::RetryConfig;
use tracing::warn;

/// Run `op` until it succeeds, returns an error `retryable` rejects, or
/// `config.max_attempts` attempts have been made. Returns the last error.
pub async fn with_retry<T, E, F, Fut, R>(config: &RetryConfig, mut op: F, retryable: R) -> Result<T, E>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  R: Fn(&E) -> bool,
  E: std::fmt::Display,
{
  let max_attempts = config.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    match op(attempt).await {
      Ok(value) => return Ok(value),
      Err(e) if attempt < max_attempts && retryable(&e) => {
        let delay = config.delay_after(attempt);
        warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn fast() -> RetryConfig {
    RetryConfig {
      max_attempts: 3,
      delay_ms: 1,
      backoff_multiplier: 2.0,
    }
  }

  #[tokio::test]
  async fn test_succeeds_after_transient_failures() {
    let calls = AtomicU32::new(0);
    let result: Result<u32, String> = with_retry(
      &fast(),
      |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if attempt < 3 {
            Err("transient".to_string())
          } else {
            Ok(attempt)
          }
        }
      },
      |_| true,
    )
    .await;

    assert_eq!(result, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_stops_at_max_attempts() {
    let calls = AtomicU32::new(0);
    let result: Result<(), String> = with_retry(
      &fast(),
      |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("down".to_string()) }
      },
      |_| true,
    )
    .await;

    assert_eq!(result, Err("down".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_non_retryable_error_returns_immediately() {
    let calls = AtomicU32::new(0);
    let result: Result<(), String> = with_retry(
      &fast(),
      |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("bad request".to_string()) }
      },
      |e| !e.starts_with("bad"),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
