//! JSON-RPC envelope types
//!
//! The agent process speaks a JSON-RPC 2.0 dialect where the `jsonrpc` field
//! is optional. Envelopes are classified by which of `id`, `method`,
//! `result` and `error` are present.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Request identifier (numeric for our own calls, either form for the remote's)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Outbound or inbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Fire-and-forget message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }
}

/// A classified inbound frame
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// Returns `None` for values that are not JSON-RPC envelopes at all.
    pub fn from_value(value: Value) -> Option<Self> {
        let obj = value.as_object()?;
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let has_method = obj.get("method").is_some_and(Value::is_string);

        match (has_id, has_method) {
            (true, true) => serde_json::from_value(value).ok().map(Message::Request),
            (false, true) => serde_json::from_value(value).ok().map(Message::Notification),
            (true, false) if obj.contains_key("result") || obj.contains_key("error") => {
                serde_json::from_value(value).ok().map(Message::Response)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request_notification_response() {
        let req = Message::from_value(json!({"id": 7, "method": "execCommandApproval", "params": {}}));
        assert!(matches!(req, Some(Message::Request(r)) if r.id == RequestId::Number(7)));

        let note = Message::from_value(json!({"method": "turn/started", "params": {"threadId": "t"}}));
        assert!(matches!(note, Some(Message::Notification(n)) if n.method == "turn/started"));

        let resp = Message::from_value(json!({"jsonrpc": "2.0", "id": "abc", "result": {"ok": true}}));
        assert!(matches!(resp, Some(Message::Response(r)) if r.id == RequestId::String("abc".into())));
    }

    #[test]
    fn test_error_response_keeps_error_object() {
        let msg = Message::from_value(json!({
            "id": 3,
            "error": {"code": -32000, "message": "thread not found"}
        }));
        match msg {
            Some(Message::Response(r)) => {
                let err = r.error.unwrap();
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "thread not found");
                assert!(r.result.is_none());
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_envelopes() {
        assert!(Message::from_value(json!("hello")).is_none());
        assert!(Message::from_value(json!({"id": 1})).is_none());
        assert!(Message::from_value(json!({"id": null, "result": 1})).is_none());
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::from(42).to_string(), "42");
        assert_eq!(RequestId::from("req-1").to_string(), "req-1");
    }
}
