//! HttpHandler against a local server that plays back canned responses.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tasker_config::{HttpConfig, RetryConfig};
use tasker_host::{CallContext, ServiceError, ServiceHandler};
use tasker_host_http::HttpHandler;
use tasker_store::{MemoryStore, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `responses` in order, one per connection. Returns the base url and
/// the raw requests received.
async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
  let listener = TcpListener::bind("127.0.0.1:0")
    .await
    .expect("failed to bind");
  let addr = listener.local_addr().expect("failed to get addr");
  let requests = Arc::new(Mutex::new(Vec::new()));
  let seen = requests.clone();

  tokio::spawn(async move {
    for (status, body) in responses {
      let Ok((mut socket, _)) = listener.accept().await else {
        return;
      };

      let mut buf = vec![0u8; 16 * 1024];
      let mut read = 0;
      loop {
        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
        if n == 0 {
          break;
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
          break;
        }
      }
      seen
        .lock()
        .expect("requests lock")
        .push(String::from_utf8_lossy(&buf[..read]).to_string());

      let reason = if status < 300 { "OK" } else { "Error" };
      let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
      );
      let _ = socket.write_all(response.as_bytes()).await;
      let _ = socket.shutdown().await;
    }
  });

  (format!("http://{}", addr), requests)
}

fn handler() -> HttpHandler {
  let client = reqwest::Client::builder()
    .no_proxy()
    .build()
    .expect("failed to build client");
  HttpHandler::with_client(
    client,
    HttpConfig {
      request_timeout_ms: 5_000,
      retry: RetryConfig {
        max_attempts: 3,
        delay_ms: 1,
        backoff_multiplier: 2.0,
      },
    },
  )
}

fn ctx(store: Arc<dyn Store>) -> CallContext {
  CallContext {
    task_run_id: "run-1".to_string(),
    stack_run_id: "stack-1".to_string(),
    store,
  }
}

#[tokio::test]
async fn test_server_error_is_retried() {
  let (base, requests) = serve(vec![(503, r#"{"error":"busy"}"#), (200, r#"{"ok":true}"#)]).await;
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

  let output = handler()
    .call(&ctx(store), "get", &[json!(format!("{}/status", base))])
    .await
    .expect("request should succeed on retry");

  assert_eq!(output["status"], 200);
  assert_eq!(output["body"], json!({"ok": true}));
  assert_eq!(requests.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
  let (base, requests) = serve(vec![(404, r#""missing""#)]).await;
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

  let err = handler()
    .call(&ctx(store), "get", &[json!(format!("{}/nope", base))])
    .await
    .expect_err("404 should fail the call");

  match err {
    ServiceError::Failed { details, .. } => {
      let details = details.expect("details");
      assert_eq!(details["status"], 404);
      assert_eq!(details["body"], json!("missing"));
    }
    other => panic!("unexpected error: {:?}", other),
  }
  assert_eq!(requests.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn test_auth_key_sends_bearer_token() {
  let (base, requests) = serve(vec![(200, r#"{"domains":["a.com"]}"#)]).await;
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
  store
    .set_keystore("directory-token", json!("secret"), json!({}))
    .await
    .expect("failed to set keystore");

  let output = handler()
    .call(
      &ctx(store),
      "request",
      &[json!({
        "method": "GET",
        "url": format!("{}/domains", base),
        "auth_key": "directory-token",
      })],
    )
    .await
    .expect("request");

  assert_eq!(output["body"]["domains"], json!(["a.com"]));
  let raw = requests.lock().expect("lock")[0].to_lowercase();
  assert!(raw.contains("authorization: bearer secret"));
}

#[tokio::test]
async fn test_missing_auth_key_fails_without_request() {
  let (base, requests) = serve(vec![(200, "{}")]).await;
  let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

  let err = handler()
    .call(
      &ctx(store),
      "request",
      &[json!({ "url": base, "auth_key": "absent" })],
    )
    .await
    .expect_err("missing credential");

  assert!(matches!(err, ServiceError::InvalidArguments { .. }));
  assert!(requests.lock().expect("lock").is_empty());
}
