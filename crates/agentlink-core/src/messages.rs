//! Canonical message types
//!
//! `UiMessage` is what the UI sends TO the bridge; `CanonicalMessage` is what
//! the bridge emits FROM the agent. Both are tagged by `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::PermissionMode;

/// One block of assistant content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Assistant message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub content: Vec<ContentBlock>,
    /// Always null: turn completion is reported by `result`
    pub stop_reason: Option<String>,
}

/// A permission prompt for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Token counters for one turn or a whole thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

/// One rate-limit window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<i64>,
}

/// Latest known rate limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<RateLimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<RateLimitWindow>,
}

/// Partial update of session metadata; unset fields are unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_used_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitSnapshot>,
}

/// Coarse session activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
}

/// Messages sent FROM the bridge to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalMessage {
    /// Handshake completed (again, after a reconnect)
    SessionInit {
        session_id: String,
        thread_id: String,
        model: Option<String>,
        cwd: String,
        permission_mode: PermissionMode,
    },
    SessionUpdate {
        session_id: String,
        update: SessionUpdate,
    },
    StatusChange {
        status: SessionStatus,
    },
    Assistant {
        message: AssistantMessage,
        parent_tool_use_id: Option<String>,
    },
    /// Turn finished
    Result {
        session_id: String,
        subtype: String,
        is_error: bool,
        result: String,
        duration_ms: u64,
        num_turns: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    PermissionRequest {
        request: PermissionRequest,
    },
    /// A request the bridge answered without asking the user
    PermissionAutoResolved {
        request_id: String,
        tool_name: String,
        behavior: PermissionBehavior,
        reason: String,
    },
    /// A prompt that will never be answered
    PermissionCancelled {
        request_id: String,
        reason: String,
    },
    StreamEvent {
        event: Value,
        parent_tool_use_id: Option<String>,
    },
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        elapsed_time_seconds: f64,
        parent_tool_use_id: Option<String>,
    },
    McpStatus {
        servers: Value,
    },
    Error {
        message: String,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
}

impl CanonicalMessage {
    /// Create an assistant message
    pub fn assistant(
        id: impl Into<String>,
        model: Option<String>,
        content: Vec<ContentBlock>,
        parent_tool_use_id: Option<String>,
    ) -> Self {
        Self::Assistant {
            message: AssistantMessage {
                id: id.into(),
                role: "assistant".to_string(),
                model,
                content,
                stop_reason: None,
            },
            parent_tool_use_id,
        }
    }

    /// Create a stream event
    pub fn stream_event(event: Value, parent_tool_use_id: Option<String>) -> Self {
        Self::StreamEvent {
            event,
            parent_tool_use_id,
        }
    }

    /// Create a text delta stream event
    pub fn text_delta(text: &str, parent_tool_use_id: Option<String>) -> Self {
        Self::stream_event(
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": text }
            }),
            parent_tool_use_id,
        )
    }

    /// Create a thinking delta stream event
    pub fn thinking_delta(thinking: &str, parent_tool_use_id: Option<String>) -> Self {
        Self::stream_event(
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "thinking_delta", "thinking": thinking }
            }),
            parent_tool_use_id,
        )
    }

    /// Create a content block start stream event
    pub fn block_start(block_type: &str, parent_tool_use_id: Option<String>) -> Self {
        Self::stream_event(
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": block_type }
            }),
            parent_tool_use_id,
        )
    }

    /// Create a content block stop stream event
    pub fn block_stop(parent_tool_use_id: Option<String>) -> Self {
        Self::stream_event(
            json!({ "type": "content_block_stop", "index": 0 }),
            parent_tool_use_id,
        )
    }

    /// Create an error output
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a status change
    pub fn status(status: SessionStatus) -> Self {
        Self::StatusChange { status }
    }

    /// Create a permission cancellation
    pub fn permission_cancelled(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionCancelled {
            request_id: request_id.into(),
            reason: reason.into(),
        }
    }

    /// The `type` tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::SessionUpdate { .. } => "session_update",
            Self::StatusChange { .. } => "status_change",
            Self::Assistant { .. } => "assistant",
            Self::Result { .. } => "result",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionAutoResolved { .. } => "permission_auto_resolved",
            Self::PermissionCancelled { .. } => "permission_cancelled",
            Self::StreamEvent { .. } => "stream_event",
            Self::ToolProgress { .. } => "tool_progress",
            Self::McpStatus { .. } => "mcp_status",
            Self::Error { .. } => "error",
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// User decision on a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// An answer to one question: a single choice or several
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    One(String),
    Many(Vec<String>),
}

impl Answer {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Answer::One(s) => vec![s],
            Answer::Many(v) => v,
        }
    }
}

/// Messages sent TO the bridge from the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessage {
    /// Start a turn
    UserMessage { content: String },
    /// Stop the running turn
    Interrupt,
    /// Answer a permission request
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default)]
        updated_input: Option<Value>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        answers: Option<HashMap<String, Answer>>,
    },
    /// Output of a dynamic tool call executed by the host
    ToolCallResponse {
        call_id: String,
        success: bool,
        output: String,
    },
    McpGetStatus,
    McpReload,
    McpToggle { server: String, enabled: bool },
    SetPermissionMode { mode: PermissionMode },
    SetModel { model: String },
}

impl UiMessage {
    /// Create a user message input
    pub fn user_message(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
        }
    }

    /// Allow a permission request
    pub fn allow(request_id: impl Into<String>) -> Self {
        Self::PermissionResponse {
            request_id: request_id.into(),
            behavior: PermissionBehavior::Allow,
            updated_input: None,
            message: None,
            answers: None,
        }
    }

    /// Deny a permission request
    pub fn deny(request_id: impl Into<String>, message: Option<String>) -> Self {
        Self::PermissionResponse {
            request_id: request_id.into(),
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message,
            answers: None,
        }
    }

    /// Messages that may wait in the outbound queue until the handshake ends
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            Self::UserMessage { .. }
                | Self::McpGetStatus
                | Self::McpReload
                | Self::McpToggle { .. }
                | Self::SetPermissionMode { .. }
                | Self::SetModel { .. }
        )
    }

    /// The `type` tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::Interrupt => "interrupt",
            Self::PermissionResponse { .. } => "permission_response",
            Self::ToolCallResponse { .. } => "tool_call_response",
            Self::McpGetStatus => "mcp_get_status",
            Self::McpReload => "mcp_reload",
            Self::McpToggle { .. } => "mcp_toggle",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SetModel { .. } => "set_model",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_serializes_null_stop_reason() {
        let msg = CanonicalMessage::assistant(
            "msg_item_1",
            Some("gpt-5".into()),
            vec![ContentBlock::text("hi")],
            None,
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "assistant");
        assert!(value["message"]["stop_reason"].is_null());
        assert!(value["message"].as_object().unwrap().contains_key("stop_reason"));
        assert_eq!(value["message"]["content"][0]["type"], "text");
    }

    #[test]
    fn test_ui_message_parsing() {
        let msg: UiMessage = serde_json::from_str(
            r#"{"type":"permission_response","request_id":"r1","behavior":"allow","answers":{"q1":"Yes","q2":["a","b"]}}"#,
        )
        .unwrap();
        match msg {
            UiMessage::PermissionResponse { request_id, behavior, answers, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(behavior, PermissionBehavior::Allow);
                let answers = answers.unwrap();
                assert_eq!(answers["q1"].clone().into_vec(), vec!["Yes".to_string()]);
                assert_eq!(answers["q2"].clone().into_vec().len(), 2);
            }
            other => panic!("Expected PermissionResponse, got {:?}", other),
        }

        let mode: UiMessage =
            serde_json::from_str(r#"{"type":"set_permission_mode","mode":"plan"}"#).unwrap();
        assert_eq!(mode, UiMessage::SetPermissionMode { mode: PermissionMode::Plan });
    }

    #[test]
    fn test_queueable_types() {
        assert!(UiMessage::user_message("hi").is_queueable());
        assert!(UiMessage::McpGetStatus.is_queueable());
        assert!(!UiMessage::Interrupt.is_queueable());
        assert!(!UiMessage::allow("r").is_queueable());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let msgs = vec![
            CanonicalMessage::Connected,
            CanonicalMessage::error("x"),
            CanonicalMessage::permission_cancelled("r", "gone"),
            CanonicalMessage::block_stop(None),
        ];
        for msg in msgs {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }
}
