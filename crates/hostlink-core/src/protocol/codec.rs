//! Frame codec: one JSON document per transport message.
//!
//! `decode` classifies untrusted bytes into exactly one envelope shape.
//! It performs no semantic checks (unknown methods are the dispatch table's
//! concern).

use super::envelope::{
    Envelope, Notification, Request, RequestId, Response, RpcError, JSONRPC_VERSION,
};
use crate::config::BusConfig;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The bytes are not a JSON document.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed JSON that matches no envelope shape.
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
}

impl DecodeError {
    fn invalid(message: impl Into<String>) -> Self {
        DecodeError::InvalidRequest(message.into())
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            DecodeError::Parse(message) => RpcError::parse_error(message.clone()),
            DecodeError::InvalidRequest(message) => RpcError::invalid_request(message.clone()),
        }
    }

    /// The error Response a connection sends back for this frame.
    ///
    /// The id is always `null`. An id read from a malformed frame is not
    /// trusted: echoing one from a response-shaped frame would settle an
    /// unrelated request on the peer.
    pub fn to_response(&self) -> Response {
        Response::error(None, self.to_rpc_error())
    }
}

/// Decode one frame.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > BusConfig::MAX_MESSAGE_SIZE {
        return Err(DecodeError::invalid(format!(
            "Message of {} bytes exceeds maximum of {} bytes",
            bytes.len(),
            BusConfig::MAX_MESSAGE_SIZE
        )));
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Parse(e.to_string()))?;

    decode_value(value)
}

/// Decode a frame that is already text.
pub fn decode_str(text: &str) -> Result<Envelope, DecodeError> {
    decode(text.as_bytes())
}

/// Classify a parsed JSON value.
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let mut object = match value {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err(DecodeError::invalid("Batch requests are not supported"))
        }
        _ => return Err(DecodeError::invalid("Envelope must be a JSON object")),
    };

    match object.get("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        Some(_) => return Err(DecodeError::invalid("Unsupported jsonrpc version")),
        None => return Err(DecodeError::invalid("Missing jsonrpc member")),
    }

    let raw_id = object.remove("id");
    let parsed_id = raw_id.as_ref().and_then(RequestId::from_value);

    let has_method = object.contains_key("method");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if has_method {
        if has_result || has_error {
            return Err(DecodeError::invalid(
                "Envelope mixes method with result or error",
            ));
        }
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(DecodeError::invalid("method must be a string")),
        };
        let params = object.remove("params");

        return match raw_id {
            None => Ok(Envelope::Notification(Notification { method, params })),
            Some(raw) => match parsed_id {
                Some(id) => Ok(Envelope::Request(Request { method, params, id })),
                None => Err(DecodeError::invalid(format!(
                    "Request id must be a string or integer, got {}",
                    raw
                ))),
            },
        };
    }

    if has_result || has_error {
        let id = match raw_id {
            None => {
                return Err(DecodeError::invalid("Response is missing id"));
            }
            Some(Value::Null) => None,
            Some(raw) => match parsed_id {
                Some(id) => Some(id),
                None => {
                    return Err(DecodeError::invalid(format!(
                        "Response id must be a string, integer or null, got {}",
                        raw
                    )))
                }
            },
        };

        if has_result && has_error {
            return Err(DecodeError::invalid("Response carries both result and error"));
        }

        let outcome = if has_result {
            Ok(object.remove("result").unwrap_or(Value::Null))
        } else {
            let error = object.remove("error").unwrap_or(Value::Null);
            Err(decode_error_object(error).map_err(DecodeError::invalid)?)
        };

        return Ok(Envelope::Response(Response { id, outcome }));
    }

    Err(DecodeError::invalid(
        "Envelope is neither a request, response nor notification",
    ))
}

fn decode_error_object(value: Value) -> Result<RpcError, String> {
    let mut object: Map<String, Value> = match value {
        Value::Object(object) => object,
        _ => return Err("error must be an object".into()),
    };

    let code = object
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .ok_or_else(|| "error.code must be an integer".to_string())?;

    let message = match object.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err("error.message must be a string".into()),
    };

    Ok(RpcError {
        code,
        message,
        data: object.remove("data"),
    })
}

/// Encode an envelope to its text frame.
pub fn encode(envelope: &Envelope) -> String {
    envelope.to_value().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use serde_json::json;

    fn decode_json(value: Value) -> Result<Envelope, DecodeError> {
        decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_request() {
        let env = decode(br#"{"jsonrpc":"2.0","method":"host.getSceneInfo","id":1}"#).unwrap();
        assert_eq!(
            env,
            Envelope::Request(Request::new("host.getSceneInfo", None, 1))
        );
    }

    #[test]
    fn test_decode_notification() {
        let env = decode_json(json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": 1}}))
            .unwrap();
        assert_eq!(
            env,
            Envelope::Notification(Notification::new("tick", Some(json!({"n": 1}))))
        );
    }

    #[test]
    fn test_decode_response_variants() {
        let ok = decode_json(json!({"jsonrpc": "2.0", "id": "a", "result": null})).unwrap();
        assert_eq!(ok, Envelope::Response(Response::success("a".into(), Value::Null)));

        let err = decode_json(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        match err {
            Envelope::Response(Response { id: None, outcome: Err(e) }) => {
                assert_eq!(e.kind(), Some(ErrorCode::ParseError));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_not_json_is_parse_error() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Parse(_)));
        let response = err.to_response();
        assert_eq!(response.id, None);
        assert_eq!(response.outcome.unwrap_err().code, -32700);
    }

    #[test]
    fn test_shape_errors_are_invalid_request() {
        let cases = [
            json!([1, 2]),
            json!("text"),
            json!({"method": "x", "id": 1}),
            json!({"jsonrpc": "1.0", "method": "x"}),
            json!({"jsonrpc": "2.0"}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "method": 5}),
            json!({"jsonrpc": "2.0", "method": "x", "id": 1.5}),
            json!({"jsonrpc": "2.0", "method": "x", "id": 1, "result": 3}),
            json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "m"}}),
            json!({"jsonrpc": "2.0", "id": 1, "error": "oops"}),
            json!({"jsonrpc": "2.0", "result": 1}),
        ];
        for case in cases {
            let err = decode_json(case.clone()).unwrap_err();
            assert_eq!(
                err.to_rpc_error().code,
                -32600,
                "expected InvalidRequest for {}",
                case
            );
        }
    }

    #[test]
    fn test_invalid_frames_are_answered_with_null_id() {
        let cases = [
            json!({"jsonrpc": "2.0", "method": 7, "id": 42}),
            json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "m"}}),
            json!({"jsonrpc": "2.0", "id": 1, "error": "oops"}),
            json!({"jsonrpc": "1.0", "method": "x", "id": 3}),
        ];
        for case in cases {
            let response = decode_json(case.clone()).unwrap_err().to_response();
            assert_eq!(response.id, None, "id echoed for {}", case);
            assert_eq!(response.outcome.unwrap_err().code, -32600);
        }
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let frame = vec![b' '; BusConfig::MAX_MESSAGE_SIZE + 1];
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidRequest(_)));
    }

    #[test]
    fn test_encode_decode_preserves_envelope() {
        let envelopes = vec![
            Envelope::Request(Request::new("host.getObjectInfo", Some(json!({"id": 3})), "r-1")),
            Envelope::Notification(Notification::new("tick", None)),
            Envelope::Response(Response::error(
                Some(RequestId::Number(9)),
                RpcError::new(ErrorCode::Timeout, "Request timed out")
                    .with_data(json!({"after_ms": 10})),
            )),
        ];
        for envelope in envelopes {
            assert_eq!(decode_str(&encode(&envelope)).unwrap(), envelope);
        }
    }
}
