//! Outbound HTTP service for tasker.
//!
//! Registered under the `http` service name. Methods:
//! - `request({ method, url, headers?, body?, auth_key? })`
//! - `get(url, headers?)`
//! - `post(url, body?, headers?)`, `put(...)`, `patch(...)`
//! - `delete(url, headers?)`
//!
//! `auth_key` names a keystore entry whose value is sent as a bearer token.
//! Transport errors and 5xx responses are retried with backoff; any other
//! non-2xx response fails the call with `{ status, body }` as details.

mod retry;

pub use retry::with_retry;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use tasker_config::HttpConfig;
use tasker_host::{CallContext, ServiceError, ServiceHandler, string_arg};
use tracing::{debug, instrument};

/// Service name the handler is registered under.
pub const HTTP_SERVICE: &str = "http";

/// Errors from performing an HTTP call.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
  /// The call's arguments do not describe a valid request.
  #[error("invalid request: {message}")]
  InvalidRequest { message: String },

  /// The request could not be sent or the response not read.
  #[error("request failed: {0}")]
  Transport(#[from] reqwest::Error),

  /// The server answered with a non-success status.
  #[error("http status {status}")]
  Status { status: u16, body: Value },
}

impl HttpError {
  fn is_retryable(&self) -> bool {
    match self {
      Self::Transport(_) => true,
      Self::Status { status, .. } => *status >= 500,
      Self::InvalidRequest { .. } => false,
    }
  }
}

impl From<HttpError> for ServiceError {
  fn from(err: HttpError) -> Self {
    match err {
      HttpError::InvalidRequest { message } => ServiceError::InvalidArguments { message },
      HttpError::Status { status, ref body } => ServiceError::Failed {
        message: err.to_string(),
        details: Some(json!({ "status": status, "body": body })),
      },
      HttpError::Transport(e) => ServiceError::failed(format!("request failed: {}", e)),
    }
  }
}

/// A request as described by call arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpRequest {
  #[serde(default = "default_method")]
  pub method: String,
  pub url: String,
  #[serde(default)]
  pub headers: HashMap<String, String>,
  #[serde(default)]
  pub body: Option<Value>,
  /// Keystore key holding a bearer token.
  #[serde(default)]
  pub auth_key: Option<String>,
}

fn default_method() -> String {
  "GET".to_string()
}

impl HttpRequest {
  /// Build a request from a call's method name and arguments.
  pub fn from_call(method: &str, args: &[Value]) -> Result<Self, HttpError> {
    let invalid = |message: String| HttpError::InvalidRequest { message };

    let headers = |index: usize| -> Result<HashMap<String, String>, HttpError> {
      match args.get(index) {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(value) => serde_json::from_value(value.clone())
          .map_err(|e| invalid(format!("headers: {}", e))),
      }
    };

    match method {
      "request" => {
        let spec = args
          .first()
          .cloned()
          .ok_or_else(|| invalid("argument 0 (request) is required".to_string()))?;
        serde_json::from_value(spec).map_err(|e| invalid(e.to_string()))
      }
      "get" | "delete" => Ok(Self {
        method: method.to_uppercase(),
        url: string_arg(args, 0, "url")
          .map_err(|e| invalid(e.to_string()))?
          .to_string(),
        headers: headers(1)?,
        body: None,
        auth_key: None,
      }),
      "post" | "put" | "patch" => Ok(Self {
        method: method.to_uppercase(),
        url: string_arg(args, 0, "url")
          .map_err(|e| invalid(e.to_string()))?
          .to_string(),
        headers: headers(2)?,
        body: args.get(1).filter(|v| !v.is_null()).cloned(),
        auth_key: None,
      }),
      other => Err(invalid(format!("unknown http method '{}'", other))),
    }
  }
}

fn parse_method(method: &str) -> Result<Method, HttpError> {
  match method.to_uppercase().as_str() {
    "GET" => Ok(Method::GET),
    "POST" => Ok(Method::POST),
    "PUT" => Ok(Method::PUT),
    "DELETE" => Ok(Method::DELETE),
    "PATCH" => Ok(Method::PATCH),
    "HEAD" => Ok(Method::HEAD),
    "OPTIONS" => Ok(Method::OPTIONS),
    _ => Err(HttpError::InvalidRequest {
      message: format!("unsupported HTTP method: {}", method),
    }),
  }
}

fn parse_url(raw: &str) -> Result<url::Url, HttpError> {
  let url = url::Url::parse(raw).map_err(|e| HttpError::InvalidRequest {
    message: format!("invalid url '{}': {}", raw, e),
  })?;
  match url.scheme() {
    "http" | "https" => Ok(url),
    scheme => Err(HttpError::InvalidRequest {
      message: format!("unsupported url scheme: {}", scheme),
    }),
  }
}

/// `http` service handler.
pub struct HttpHandler {
  client: Client,
  config: HttpConfig,
}

impl HttpHandler {
  pub fn new(config: HttpConfig) -> Self {
    Self::with_client(Client::new(), config)
  }

  /// Use a preconfigured client (proxies, TLS roots).
  pub fn with_client(client: Client, config: HttpConfig) -> Self {
    Self { client, config }
  }

  /// Send one request, retrying per the configured policy.
  #[instrument(name = "http_request", skip(self, request, bearer), fields(method = %request.method, url = %request.url))]
  pub async fn send(&self, request: &HttpRequest, bearer: Option<&str>) -> Result<Value, HttpError> {
    let method = parse_method(&request.method)?;
    let url = parse_url(&request.url)?;
    let timeout = Duration::from_millis(self.config.request_timeout_ms);

    with_retry(
      &self.config.retry,
      |attempt| {
        let method = method.clone();
        let url = url.clone();
        async move {
          debug!(attempt, "http_attempt");
          let mut builder = self.client.request(method, url).timeout(timeout);
          for (key, value) in &request.headers {
            builder = builder.header(key, value);
          }
          if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
          }
          if let Some(body) = &request.body {
            builder = builder.json(body);
          }

          let response = builder.send().await?;
          let status = response.status().as_u16();
          let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
              v.to_str()
                .ok()
                .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect();
          let text = response.text().await?;
          // JSON bodies are returned structured, anything else as a string.
          let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

          if !(200..300).contains(&status) {
            return Err(HttpError::Status { status, body });
          }
          Ok(json!({ "status": status, "headers": headers, "body": body }))
        }
      },
      HttpError::is_retryable,
    )
    .await
  }
}

#[async_trait]
impl ServiceHandler for HttpHandler {
  async fn call(
    &self,
    ctx: &CallContext,
    method: &str,
    args: &[Value],
  ) -> Result<Value, ServiceError> {
    let request = HttpRequest::from_call(method, args)?;

    let bearer = match &request.auth_key {
      Some(key) => {
        let entry = ctx.store.get_keystore(key).await?;
        let token = entry
          .and_then(|e| e.value.as_str().map(str::to_string))
          .ok_or_else(|| ServiceError::InvalidArguments {
            message: format!("keystore entry '{}' is missing or not a string", key),
          })?;
        Some(token)
      }
      None => None,
    };

    Ok(self.send(&request, bearer.as_deref()).await?)
  }
}
