//! Approval routing
//!
//! Every approval-shaped request from the agent becomes one [`Approval`]
//! variant. All variants share the same resolution interface: describe
//! themselves as a canonical permission request, and build the upstream
//! reply for a user decision in their own vocabulary.

use std::collections::HashMap;

use agentlink_rpc::RequestId;
use serde_json::{json, Value};

use crate::config::{BridgeConfig, PermissionMode};
use crate::messages::{Answer, PermissionBehavior, PermissionRequest};
use crate::translator::{command_text, dynamic_tool_name, mcp_tool_name};

/// Dynamic tool the agent calls to leave plan mode
pub const PLAN_EXIT_TOOL: &str = "ExitPlanMode";

/// Tool name used for multi-question prompts
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// An approval request from the agent, one variant per inbound shape
#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    /// `item/commandExecution/requestApproval`
    InlineCommand {
        item_id: Option<String>,
        command: String,
        cwd: Option<String>,
        reason: Option<String>,
    },
    /// `execCommandApproval`
    ExternalCommand {
        call_id: Option<String>,
        command: String,
        cwd: String,
        reason: Option<String>,
    },
    /// `item/fileChange/requestApproval`
    InlineFileChange {
        item_id: Option<String>,
        file_paths: Vec<String>,
        changes: Value,
        reason: Option<String>,
    },
    /// `applyPatchApproval`
    Patch {
        call_id: Option<String>,
        file_paths: Vec<String>,
        changes: Value,
        reason: Option<String>,
    },
    /// `item/mcpToolCall/requestApproval`
    McpTool {
        call_id: Option<String>,
        server: String,
        tool: String,
        arguments: Value,
        description: Option<String>,
    },
    /// `item/tool/call`
    DynamicTool {
        call_id: String,
        tool: String,
        arguments: Value,
    },
    /// `item/tool/requestUserInput`
    UserInput {
        item_id: Option<String>,
        questions: Value,
    },
}

/// A user's answer to a permission request
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub allow: bool,
    pub message: Option<String>,
    pub answers: HashMap<String, Vec<String>>,
    /// Output text for dynamic tool calls
    pub output: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Default::default()
        }
    }

    pub fn deny(message: Option<String>) -> Self {
        Self {
            allow: false,
            message,
            ..Default::default()
        }
    }

    /// Build from the fields of a `permission_response`
    pub fn from_response(
        behavior: PermissionBehavior,
        message: Option<String>,
        answers: Option<HashMap<String, Answer>>,
    ) -> Self {
        Self {
            allow: behavior == PermissionBehavior::Allow,
            message,
            answers: answers
                .unwrap_or_default()
                .into_iter()
                .map(|(id, answer)| (id, answer.into_vec()))
                .collect(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

fn str_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn paths_from_list(changes: &Value) -> Vec<String> {
    changes
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|c| c.get("path").and_then(|p| p.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl Approval {
    /// Classify an inbound request. Returns None for methods that are not
    /// approval-shaped.
    pub fn from_request(method: &str, params: &Value, config: &BridgeConfig) -> Option<Self> {
        let approval = match method {
            "item/commandExecution/requestApproval" => Approval::InlineCommand {
                item_id: str_field(params, "itemId"),
                command: command_text(params.get("command").unwrap_or(&Value::Null)),
                cwd: str_field(params, "cwd"),
                reason: str_field(params, "reason"),
            },
            "execCommandApproval" => Approval::ExternalCommand {
                call_id: str_field(params, "callId"),
                command: command_text(params.get("command").unwrap_or(&Value::Null)),
                cwd: str_field(params, "cwd")
                    .unwrap_or_else(|| config.cwd.display().to_string()),
                reason: str_field(params, "reason"),
            },
            "item/fileChange/requestApproval" => {
                let changes = params.get("changes").cloned().unwrap_or(Value::Null);
                Approval::InlineFileChange {
                    item_id: str_field(params, "itemId"),
                    file_paths: paths_from_list(&changes),
                    changes,
                    reason: str_field(params, "reason"),
                }
            }
            "applyPatchApproval" => {
                let changes = params.get("fileChanges").cloned().unwrap_or(Value::Null);
                let mut file_paths: Vec<String> = changes
                    .as_object()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                file_paths.sort();
                Approval::Patch {
                    call_id: str_field(params, "callId"),
                    file_paths,
                    changes,
                    reason: str_field(params, "reason"),
                }
            }
            "item/mcpToolCall/requestApproval" => Approval::McpTool {
                call_id: str_field(params, "itemId").or_else(|| str_field(params, "callId")),
                server: str_field(params, "server").unwrap_or_default(),
                tool: str_field(params, "tool").unwrap_or_default(),
                arguments: params.get("arguments").cloned().unwrap_or(Value::Null),
                description: str_field(params, "description"),
            },
            "item/tool/call" => Approval::DynamicTool {
                call_id: str_field(params, "callId").unwrap_or_default(),
                tool: str_field(params, "tool").unwrap_or_default(),
                arguments: params.get("arguments").cloned().unwrap_or(Value::Null),
            },
            "item/tool/requestUserInput" => Approval::UserInput {
                item_id: str_field(params, "itemId"),
                questions: params.get("questions").cloned().unwrap_or_else(|| json!([])),
            },
            _ => return None,
        };
        Some(approval)
    }

    pub fn tool_name(&self) -> String {
        match self {
            Approval::InlineCommand { .. } | Approval::ExternalCommand { .. } => "Bash".to_string(),
            Approval::InlineFileChange { .. } | Approval::Patch { .. } => "Edit".to_string(),
            Approval::McpTool { server, tool, .. } => mcp_tool_name(server, tool),
            Approval::DynamicTool { tool, .. } => dynamic_tool_name(tool),
            Approval::UserInput { .. } => ASK_USER_TOOL.to_string(),
        }
    }

    pub fn input(&self) -> Value {
        match self {
            Approval::InlineCommand { command, cwd, .. } => json!({ "command": command, "cwd": cwd }),
            Approval::ExternalCommand { command, cwd, .. } => json!({ "command": command, "cwd": cwd }),
            Approval::InlineFileChange { file_paths, changes, .. } => {
                json!({ "file_paths": file_paths, "changes": changes })
            }
            Approval::Patch { file_paths, changes, .. } => {
                json!({ "file_paths": file_paths, "changes": changes })
            }
            Approval::McpTool { arguments, description, call_id, .. } => json!({
                "arguments": arguments,
                "description": description,
                "call_id": call_id,
            }),
            Approval::DynamicTool { arguments, call_id, .. } => {
                let mut input = match arguments {
                    Value::Object(_) => arguments.clone(),
                    Value::Null => json!({}),
                    other => json!({ "arguments": other }),
                };
                input["call_id"] = json!(call_id);
                input
            }
            Approval::UserInput { questions, .. } => json!({ "questions": questions }),
        }
    }

    pub fn description(&self) -> Option<String> {
        match self {
            Approval::InlineCommand { reason, .. }
            | Approval::ExternalCommand { reason, .. }
            | Approval::InlineFileChange { reason, .. }
            | Approval::Patch { reason, .. } => reason.clone(),
            Approval::McpTool { description, .. } => description.clone(),
            Approval::DynamicTool { .. } | Approval::UserInput { .. } => None,
        }
    }

    /// Tool-use id the UI can match this prompt against
    pub fn tool_use_id(&self) -> Option<String> {
        match self {
            Approval::InlineCommand { item_id, .. }
            | Approval::InlineFileChange { item_id, .. }
            | Approval::UserInput { item_id, .. } => item_id.clone(),
            Approval::ExternalCommand { call_id, .. }
            | Approval::Patch { call_id, .. }
            | Approval::McpTool { call_id, .. } => call_id.clone(),
            Approval::DynamicTool { call_id, .. } => Some(call_id.clone()),
        }
    }

    pub fn is_plan_exit(&self) -> bool {
        matches!(self, Approval::DynamicTool { tool, .. } if tool == PLAN_EXIT_TOOL)
    }

    pub fn is_dynamic_tool(&self) -> bool {
        matches!(self, Approval::DynamicTool { .. })
    }

    /// Whether the UI-facing permission mode answers this without asking
    pub fn auto_approved_by(&self, mode: PermissionMode) -> bool {
        match mode {
            PermissionMode::BypassPermissions => matches!(
                self,
                Approval::InlineCommand { .. }
                    | Approval::ExternalCommand { .. }
                    | Approval::InlineFileChange { .. }
                    | Approval::Patch { .. }
                    | Approval::McpTool { .. }
            ),
            PermissionMode::AcceptEdits => {
                matches!(self, Approval::InlineFileChange { .. } | Approval::Patch { .. })
            }
            PermissionMode::Default | PermissionMode::Plan => false,
        }
    }

    /// The canonical prompt for this request
    pub fn permission_request(&self, request_id: &str) -> PermissionRequest {
        PermissionRequest {
            request_id: request_id.to_string(),
            tool_name: self.tool_name(),
            input: self.input(),
            description: self.description(),
            tool_use_id: self.tool_use_id(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The upstream reply for a decision
    pub fn reply(&self, decision: &Decision) -> Value {
        match self {
            Approval::InlineCommand { .. }
            | Approval::InlineFileChange { .. }
            | Approval::McpTool { .. } => {
                json!({ "decision": if decision.allow { "accept" } else { "decline" } })
            }
            Approval::ExternalCommand { .. } | Approval::Patch { .. } => {
                json!({ "decision": if decision.allow { "approved" } else { "denied" } })
            }
            Approval::DynamicTool { tool, .. } => {
                let text = decision
                    .output
                    .clone()
                    .or_else(|| decision.message.clone())
                    .unwrap_or_else(|| default_tool_text(tool, decision.allow));
                tool_call_reply(decision.allow, &text)
            }
            Approval::UserInput { .. } => {
                let answers: serde_json::Map<String, Value> = if decision.allow {
                    decision
                        .answers
                        .iter()
                        .map(|(id, list)| (id.clone(), json!({ "answers": list })))
                        .collect()
                } else {
                    serde_json::Map::new()
                };
                json!({ "answers": answers })
            }
        }
    }
}

fn default_tool_text(tool: &str, allow: bool) -> String {
    match (tool == PLAN_EXIT_TOOL, allow) {
        (true, true) => "User approved the plan".to_string(),
        (true, false) => "User rejected the plan; stay in plan mode".to_string(),
        (false, true) => "Done".to_string(),
        (false, false) => "User denied the tool call".to_string(),
    }
}

/// Structured reply to `item/tool/call`
pub fn tool_call_reply(success: bool, text: &str) -> Value {
    json!({
        "success": success,
        "contentItems": [{ "type": "inputText", "text": text }],
    })
}

/// An approval waiting for the user
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request_id: String,
    pub upstream_id: RequestId,
    /// Connection the request arrived on
    pub connection: u64,
    pub approval: Approval,
}

/// Pending permissions in arrival order
#[derive(Debug, Default)]
pub struct PendingPermissions {
    entries: Vec<PendingPermission>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PendingPermission) {
        self.entries.push(entry);
    }

    /// Remove by request id. A second take of the same id returns None.
    pub fn take(&mut self, request_id: &str) -> Option<PendingPermission> {
        let pos = self.entries.iter().position(|e| e.request_id == request_id)?;
        Some(self.entries.remove(pos))
    }

    /// Remove the dynamic tool call with this call id
    pub fn take_by_call_id(&mut self, call_id: &str) -> Option<PendingPermission> {
        let pos = self.entries.iter().position(|e| {
            matches!(&e.approval, Approval::DynamicTool { call_id: id, .. } if id == call_id)
        })?;
        Some(self.entries.remove(pos))
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.iter().any(|e| e.request_id == request_id)
    }

    pub fn drain(&mut self) -> Vec<PendingPermission> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        BridgeConfig::new("/work")
    }

    fn classify(method: &str, params: Value) -> Approval {
        Approval::from_request(method, &params, &config()).unwrap()
    }

    #[test]
    fn test_external_command_uses_approved_vocabulary() {
        let approval = classify("execCommandApproval", json!({"callId": "c1", "command": ["rm", "-rf", "build"]}));
        assert_eq!(approval.tool_name(), "Bash");
        assert_eq!(approval.input()["command"], "rm -rf build");
        assert_eq!(approval.input()["cwd"], "/work");
        assert_eq!(approval.reply(&Decision::allow()), json!({"decision": "approved"}));
        assert_eq!(approval.reply(&Decision::deny(None)), json!({"decision": "denied"}));
    }

    #[test]
    fn test_inline_command_uses_accept_vocabulary() {
        let approval = classify(
            "item/commandExecution/requestApproval",
            json!({"itemId": "item_1", "command": "cargo build", "cwd": "/repo"}),
        );
        assert_eq!(approval.tool_use_id().as_deref(), Some("item_1"));
        assert_eq!(approval.input()["cwd"], "/repo");
        assert_eq!(approval.reply(&Decision::allow()), json!({"decision": "accept"}));
        assert_eq!(approval.reply(&Decision::deny(None)), json!({"decision": "decline"}));
    }

    #[test]
    fn test_patch_paths_from_change_map() {
        let approval = classify(
            "applyPatchApproval",
            json!({"callId": "p1", "fileChanges": {"src/b.rs": {"update": {}}, "src/a.rs": {"add": {}}}}),
        );
        assert_eq!(approval.tool_name(), "Edit");
        assert_eq!(approval.input()["file_paths"], json!(["src/a.rs", "src/b.rs"]));
    }

    #[test]
    fn test_mcp_tool_name_and_input() {
        let approval = classify(
            "item/mcpToolCall/requestApproval",
            json!({"itemId": "m1", "server": "github", "tool": "create_issue", "arguments": {"title": "x"}}),
        );
        assert_eq!(approval.tool_name(), "mcp:github:create_issue");
        assert_eq!(approval.input()["arguments"]["title"], "x");
        assert_eq!(approval.input()["call_id"], "m1");
    }

    #[test]
    fn test_plan_exit_replies_with_structured_payload() {
        let approval = classify(
            "item/tool/call",
            json!({"callId": "call_p", "tool": "ExitPlanMode", "arguments": {"plan": "1. do it"}}),
        );
        assert!(approval.is_plan_exit());
        assert_eq!(approval.tool_name(), "ExitPlanMode");
        assert_eq!(approval.input()["call_id"], "call_p");

        let allow = approval.reply(&Decision::allow());
        assert_eq!(allow["success"], true);
        assert_eq!(allow["contentItems"][0]["type"], "inputText");
        let deny = approval.reply(&Decision::deny(Some("not yet".into())));
        assert_eq!(deny["success"], false);
        assert_eq!(deny["contentItems"][0]["text"], "not yet");
    }

    #[test]
    fn test_dynamic_tool_name_is_prefixed() {
        let approval = classify("item/tool/call", json!({"callId": "c", "tool": "open_url", "arguments": {}}));
        assert_eq!(approval.tool_name(), "dynamic:open_url");
        assert!(!approval.is_plan_exit());
    }

    #[test]
    fn test_user_input_answer_map() {
        let approval = classify(
            "item/tool/requestUserInput",
            json!({"itemId": "q", "questions": [{"id": "color", "question": "Pick", "options": [{"label": "red"}]}]}),
        );
        assert_eq!(approval.tool_name(), "AskUserQuestion");

        let mut answers = HashMap::new();
        answers.insert("color".to_string(), Answer::One("red".into()));
        let decision = Decision::from_response(PermissionBehavior::Allow, None, Some(answers));
        assert_eq!(
            approval.reply(&decision),
            json!({"answers": {"color": {"answers": ["red"]}}})
        );
    }

    #[test]
    fn test_unknown_method_is_not_an_approval() {
        assert!(Approval::from_request("item/somethingNew", &json!({}), &config()).is_none());
    }

    #[test]
    fn test_auto_approval_by_mode() {
        let cmd = classify("execCommandApproval", json!({"command": "ls"}));
        let patch = classify("applyPatchApproval", json!({"fileChanges": {}}));
        let ask = classify("item/tool/requestUserInput", json!({}));
        assert!(cmd.auto_approved_by(PermissionMode::BypassPermissions));
        assert!(!cmd.auto_approved_by(PermissionMode::AcceptEdits));
        assert!(patch.auto_approved_by(PermissionMode::AcceptEdits));
        assert!(!ask.auto_approved_by(PermissionMode::BypassPermissions));
        assert!(!cmd.auto_approved_by(PermissionMode::Default));
    }

    #[test]
    fn test_pending_take_is_exactly_once() {
        let mut pending = PendingPermissions::new();
        pending.insert(PendingPermission {
            request_id: "r1".into(),
            upstream_id: RequestId::Number(7),
            connection: 0,
            approval: classify("item/tool/call", json!({"callId": "call_1", "tool": "t"})),
        });
        assert!(pending.take_by_call_id("call_1").is_some());
        assert!(pending.take("r1").is_none());
        assert!(pending.is_empty());
    }
}
