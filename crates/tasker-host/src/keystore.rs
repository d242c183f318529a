use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ServiceError;
use crate::registry::{CallContext, ServiceHandler, string_arg};

/// Service name the keystore handler is registered under.
pub const KEYSTORE_SERVICE: &str = "keystore";

/// Read and write keystore entries from task code.
///
/// Methods:
/// - `get(key)` returns the stored value, or null
/// - `set(key, value)` stores a value and returns `{ "key": key }`
#[derive(Debug, Default, Clone)]
pub struct KeystoreHandler;

#[async_trait]
impl ServiceHandler for KeystoreHandler {
  async fn call(
    &self,
    ctx: &CallContext,
    method: &str,
    args: &[Value],
  ) -> Result<Value, ServiceError> {
    match method {
      "get" => {
        let key = string_arg(args, 0, "key")?;
        let entry = ctx.store.get_keystore(key).await?;
        Ok(entry.map(|e| e.value).unwrap_or(Value::Null))
      }
      "set" => {
        let key = string_arg(args, 0, "key")?;
        let value = args.get(1).cloned().ok_or_else(|| ServiceError::InvalidArguments {
          message: "argument 1 (value) is required".to_string(),
        })?;
        ctx.store.set_keystore(key, value, json!({})).await?;
        Ok(json!({ "key": key }))
      }
      other => Err(ServiceError::UnknownMethod {
        service: KEYSTORE_SERVICE.to_string(),
        method: other.to_string(),
      }),
    }
  }
}
