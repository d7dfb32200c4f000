//! Store protocol messages
//!
//! Clients send one [`StoreRequest`] per WebSocket text frame and get back a
//! [`StoreResponse`] carrying the same `id`. Responses may arrive out of order.

use serde::{Deserialize, Serialize};

use glimpse_core::{ErrorCode, StoreError};

/// A request from a [`crate::RemoteStore`] to the store server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Correlation ID, echoed in the response
    pub id: u64,
    #[serde(flatten)]
    pub op: StoreOp,
}

/// Operation carried by a [`StoreRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    ListKeys { prefix: String },
    /// Conditional write; `value: None` deletes
    CompareAndSet {
        key: String,
        expected: Option<String>,
        value: Option<String>,
    },
    /// Keepalive
    Ping,
}

/// The server's answer to one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub id: u64,
    #[serde(flatten)]
    pub result: StoreResult,
}

/// Outcome of a [`StoreOp`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreResult {
    /// Reply to `get`
    Value { value: Option<String> },
    /// Reply to `set` and `delete`
    Ok,
    /// Reply to `list_keys`
    Keys { keys: Vec<String> },
    /// Reply to `compare_and_set`
    Swapped { swapped: bool },
    Pong,
    Error { code: ErrorCode, message: String },
}

impl StoreRequest {
    pub fn new(id: u64, op: StoreOp) -> Self {
        Self { id, op }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl StoreResponse {
    pub fn new(id: u64, result: StoreResult) -> Self {
        Self { id, result }
    }

    /// Create an error response
    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: StoreResult::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl StoreResult {
    /// Turn an error reply into a [`StoreError`]
    pub fn into_result(self) -> Result<StoreResult, StoreError> {
        match self {
            StoreResult::Error { code, message } => Err(StoreError::Remote { code, message }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = StoreRequest::new(
            7,
            StoreOp::Set {
                key: "glimpse_session_BA7ZUM4E".into(),
                value: "{}".into(),
            },
        );

        let json: serde_json::Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["op"], "set");
        assert_eq!(json["key"], "glimpse_session_BA7ZUM4E");

        let parsed = StoreRequest::from_json(r#"{"id":3,"op":"list_keys","prefix":"glimpse_"}"#)
            .unwrap();
        assert_eq!(
            parsed.op,
            StoreOp::ListKeys {
                prefix: "glimpse_".into()
            }
        );

        let ping = StoreRequest::from_json(r#"{"id":4,"op":"ping"}"#).unwrap();
        assert_eq!(ping.op, StoreOp::Ping);
    }

    #[test]
    fn test_response_wire_format() {
        let resp = StoreResponse::new(9, StoreResult::Value { value: None });
        let json = resp.to_json().unwrap();
        assert!(json.contains("\"result\":\"value\""));

        let parsed = StoreResponse::from_json(&json).unwrap();
        assert_eq!(parsed.id, 9);
        assert_eq!(parsed.result, StoreResult::Value { value: None });
    }

    #[test]
    fn test_error_response() {
        let resp = StoreResponse::error(1, ErrorCode::InvalidRequest, "bad frame");
        let json = resp.to_json().unwrap();
        assert!(json.contains("invalid_request"));

        let err = StoreResponse::from_json(&json)
            .unwrap()
            .result
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Remote {
                code: ErrorCode::InvalidRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_compare_and_set_wire_format() {
        let parsed = StoreRequest::from_json(
            r#"{"id":5,"op":"compare_and_set","key":"k","expected":null,"value":"[]"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.op,
            StoreOp::CompareAndSet {
                key: "k".into(),
                expected: None,
                value: Some("[]".into()),
            }
        );

        let json = StoreResponse::new(5, StoreResult::Swapped { swapped: false })
            .to_json()
            .unwrap();
        assert!(json.contains("\"result\":\"swapped\""));
        assert!(json.contains("\"swapped\":false"));
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(StoreRequest::from_json(r#"{"id":1,"op":"truncate"}"#).is_err());
    }
}
