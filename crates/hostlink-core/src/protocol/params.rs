//! Parameter extraction helpers for handlers.
//!
//! Missing or mistyped parameters become `InvalidParams` errors that can be
//! returned to the peer as-is.

use super::envelope::RpcError;
use serde_json::Value;

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub fn require_str_param(params: &Value, snake: &str, camel: &str) -> Result<String, RpcError> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| {
            RpcError::invalid_params(format!("Missing required parameter: {}", snake))
        })
}

/// Extract an optional i64 parameter, supporting both snake_case and camelCase.
pub fn get_i64_param(params: &Value, snake: &str, camel: &str) -> Option<i64> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_i64())
}

/// Extract a required i64 parameter or return an error.
pub fn require_i64_param(params: &Value, snake: &str, camel: &str) -> Result<i64, RpcError> {
    get_i64_param(params, snake, camel).ok_or_else(|| {
        RpcError::invalid_params(format!("Missing required integer parameter: {}", snake))
    })
}

/// Read a single-name argument that may be passed positionally.
///
/// Accepts `"name"`, `["name"]` and `{"<key>": "name"}`.
pub fn name_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    let name = match params {
        Some(Value::String(name)) => Some(name.as_str()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str),
        Some(object @ Value::Object(_)) => object.get(key).and_then(Value::as_str),
        _ => None,
    };

    match name {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        Some(_) => Err(RpcError::invalid_params(format!("{} must not be empty", key))),
        None => Err(RpcError::invalid_params(format!(
            "Missing required parameter: {}",
            key
        ))),
    }
}
