//! Item and turn translation
//!
//! Pure mapping from the agent's item/turn payloads to canonical content
//! blocks and messages. Nothing here touches bridge state; the bridge decides
//! when each block is emitted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::messages::{
    CanonicalMessage, ContentBlock, RateLimitSnapshot, RateLimitWindow, TokenUsage,
};
use crate::state::ItemKind;

// ============================================================================
// Item payloads
// ============================================================================

/// A thread item as reported by `item/started` and `item/completed`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ThreadItem {
    CommandExecution(CommandExecutionItem),
    FileChange(FileChangeItem),
    WebSearch(WebSearchItem),
    McpToolCall(McpToolCallItem),
    CollabAgentToolCall(CollabCallItem),
    Reasoning(ReasoningItem),
    AgentMessage(AgentMessageItem),
    Plan(PlanItem),
    DynamicToolCall(DynamicToolCallItem),
    UserMessage(UserMessageItem),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandExecutionItem {
    pub id: String,
    pub command: Value,
    pub cwd: Option<String>,
    pub status: Option<String>,
    pub aggregated_output: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileUpdate {
    pub path: String,
    pub kind: Value,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileChangeItem {
    pub id: String,
    pub changes: Vec<FileUpdate>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSearchItem {
    pub id: String,
    pub query: String,
    pub url: Option<String>,
    pub action: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct McpToolCallItem {
    pub id: String,
    pub server: String,
    pub tool: String,
    pub arguments: Value,
    pub status: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollabCallItem {
    pub id: String,
    pub tool: String,
    pub status: Option<String>,
    pub sender_thread_id: Option<String>,
    pub receiver_thread_ids: Vec<String>,
    pub prompt: Option<String>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReasoningItem {
    pub id: String,
    pub summary: Vec<String>,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentMessageItem {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanItem {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DynamicToolCallItem {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub status: Option<String>,
    pub success: Option<bool>,
    pub content_items: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserMessageItem {
    pub id: String,
}

fn is_failed(status: &Option<String>) -> bool {
    matches!(status.as_deref(), Some("failed") | Some("declined"))
}

impl ThreadItem {
    /// Parse an item payload, returning None for malformed input
    pub fn parse(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Skipping malformed item: {}", e);
                None
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        let id = match self {
            ThreadItem::CommandExecution(i) => &i.id,
            ThreadItem::FileChange(i) => &i.id,
            ThreadItem::WebSearch(i) => &i.id,
            ThreadItem::McpToolCall(i) => &i.id,
            ThreadItem::CollabAgentToolCall(i) => &i.id,
            ThreadItem::Reasoning(i) => &i.id,
            ThreadItem::AgentMessage(i) => &i.id,
            ThreadItem::Plan(i) => &i.id,
            ThreadItem::DynamicToolCall(i) => &i.id,
            ThreadItem::UserMessage(i) => &i.id,
            ThreadItem::Unknown => return None,
        };
        Some(id.as_str())
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            ThreadItem::CommandExecution(_) => ItemKind::Command,
            ThreadItem::FileChange(_) => ItemKind::FileChange,
            ThreadItem::WebSearch(_) => ItemKind::WebSearch,
            ThreadItem::McpToolCall(_) => ItemKind::McpTool,
            ThreadItem::CollabAgentToolCall(_) => ItemKind::Collab,
            ThreadItem::Reasoning(_) => ItemKind::Reasoning,
            ThreadItem::AgentMessage(_) => ItemKind::AgentMessage,
            ThreadItem::Plan(_) => ItemKind::Plan,
            ThreadItem::DynamicToolCall(_) => ItemKind::DynamicTool,
            ThreadItem::UserMessage(_) | ThreadItem::Unknown => ItemKind::Other,
        }
    }
}

// ============================================================================
// Tool blocks
// ============================================================================

/// Render a command that may be a shell string or an argument list
pub fn command_text(command: &Value) -> String {
    match command {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalize a file change kind given as `"add"` or `{"type": "add"}`
pub fn change_kind(kind: &Value) -> String {
    match kind {
        Value::String(s) => s.to_lowercase(),
        Value::Object(obj) => obj
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| t.to_lowercase())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// `Write` when every change creates a file, `Edit` otherwise
pub fn file_change_tool_name(changes: &[FileUpdate]) -> &'static str {
    let creates_only = !changes.is_empty()
        && changes
            .iter()
            .all(|c| matches!(change_kind(&c.kind).as_str(), "create" | "add"));
    if creates_only { "Write" } else { "Edit" }
}

pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("mcp:{}:{}", server, tool)
}

fn search_url(item: &WebSearchItem) -> Option<String> {
    item.url.clone().or_else(|| {
        item.action
            .as_ref()
            .and_then(|a| a.get("url"))
            .and_then(|u| u.as_str())
            .map(String::from)
    })
}

/// The tool_use block announcing a tool-like item
pub fn tool_use(item: &ThreadItem) -> Option<ContentBlock> {
    let block = match item {
        ThreadItem::CommandExecution(cmd) => ContentBlock::tool_use(
            &cmd.id,
            "Bash",
            json!({
                "command": command_text(&cmd.command),
                "cwd": cmd.cwd,
            }),
        ),
        ThreadItem::FileChange(fc) => {
            let changes: Vec<Value> = fc
                .changes
                .iter()
                .map(|c| json!({ "path": c.path, "kind": change_kind(&c.kind), "diff": c.diff }))
                .collect();
            let file_paths: Vec<&str> = fc.changes.iter().map(|c| c.path.as_str()).collect();
            let mut input = json!({ "changes": changes, "file_paths": file_paths });
            if let [single] = fc.changes.as_slice() {
                input["file_path"] = json!(single.path);
            }
            ContentBlock::tool_use(&fc.id, file_change_tool_name(&fc.changes), input)
        }
        ThreadItem::WebSearch(ws) => {
            ContentBlock::tool_use(&ws.id, "WebSearch", json!({ "query": ws.query }))
        }
        ThreadItem::McpToolCall(mcp) => ContentBlock::tool_use(
            &mcp.id,
            mcp_tool_name(&mcp.server, &mcp.tool),
            mcp.arguments.clone(),
        ),
        ThreadItem::CollabAgentToolCall(call) => ContentBlock::tool_use(
            &call.id,
            "Task",
            json!({
                "description": call.prompt.clone().unwrap_or_default(),
                "subagent_type": call.tool,
                "status": call.status,
                "receiver_thread_ids": call.receiver_thread_ids,
            }),
        ),
        ThreadItem::DynamicToolCall(dt) => ContentBlock::tool_use(
            &dt.id,
            dynamic_tool_name(&dt.tool),
            dt.arguments.clone(),
        ),
        _ => return None,
    };
    Some(block)
}

/// Canonical name for a host-executed tool
pub fn dynamic_tool_name(tool: &str) -> String {
    if tool == crate::approval::PLAN_EXIT_TOOL {
        tool.to_string()
    } else {
        format!("dynamic:{}", tool)
    }
}

fn error_text(error: &Option<Value>) -> Option<String> {
    error.as_ref().map(|e| match e {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| other.to_string()),
    })
}

/// Join the `text` entries of a content item list
pub fn content_items_text(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The tool_result closing a tool-like item, if any.
///
/// `duration` is the measured run time of a command; it is appended to the
/// result text when at or above `floor_ms`.
pub fn tool_result(item: &ThreadItem, duration: Option<Duration>, floor_ms: u64) -> Option<ContentBlock> {
    match item {
        ThreadItem::CommandExecution(cmd) => {
            let output = cmd.aggregated_output.clone().unwrap_or_default();
            let exit_code = cmd.exit_code.unwrap_or(0);
            let failed = exit_code != 0 || is_failed(&cmd.status);
            if output.trim().is_empty() && !failed {
                return None;
            }
            let mut text = if output.trim().is_empty() {
                format!("Exit code {}", exit_code)
            } else {
                output
            };
            let elapsed = duration.or(cmd.duration_ms.map(Duration::from_millis));
            if let Some(elapsed) = elapsed {
                text = with_duration(&text, elapsed, floor_ms);
            }
            Some(ContentBlock::tool_result(&cmd.id, text, failed))
        }
        ThreadItem::FileChange(fc) => {
            let failed = is_failed(&fc.status);
            let text = if failed {
                "File changes were not applied".to_string()
            } else {
                let paths: Vec<&str> = fc.changes.iter().map(|c| c.path.as_str()).collect();
                format!("Updated {} file(s): {}", paths.len(), paths.join(", "))
            };
            Some(ContentBlock::tool_result(&fc.id, text, failed))
        }
        ThreadItem::WebSearch(ws) => {
            let text = match search_url(ws) {
                Some(url) => format!("Searched \"{}\"\n{}", ws.query, url),
                None => format!("Searched \"{}\"", ws.query),
            };
            Some(ContentBlock::tool_result(&ws.id, text, false))
        }
        ThreadItem::McpToolCall(mcp) => {
            if let Some(err) = error_text(&mcp.error) {
                return Some(ContentBlock::tool_result(&mcp.id, err, true));
            }
            let text = mcp
                .result
                .as_ref()
                .map(|r| match r.get("content").and_then(|c| c.as_array()) {
                    Some(items) => content_items_text(items),
                    None => r.to_string(),
                })
                .unwrap_or_default();
            Some(ContentBlock::tool_result(&mcp.id, text, is_failed(&mcp.status)))
        }
        ThreadItem::CollabAgentToolCall(call) => {
            if is_failed(&call.status) {
                let text = error_text(&call.error)
                    .unwrap_or_else(|| format!("Subagent call '{}' failed", call.tool));
                Some(ContentBlock::tool_result(&call.id, text, true))
            } else {
                let text = match call.receiver_thread_ids.len() {
                    0 => format!("{} completed", call.tool),
                    n => format!("{} completed ({} thread(s))", call.tool, n),
                };
                Some(ContentBlock::tool_result(&call.id, text, false))
            }
        }
        ThreadItem::DynamicToolCall(dt) => {
            let failed = dt.success == Some(false) || is_failed(&dt.status);
            Some(ContentBlock::tool_result(&dt.id, content_items_text(&dt.content_items), failed))
        }
        _ => None,
    }
}

/// Summary message nested under a failed collaboration call
pub fn collab_failure_summary(call: &CollabCallItem) -> Option<CanonicalMessage> {
    if !is_failed(&call.status) {
        return None;
    }
    let detail = error_text(&call.error).unwrap_or_else(|| "no details".to_string());
    Some(CanonicalMessage::assistant(
        format!("msg_{}_summary", call.id),
        None,
        vec![ContentBlock::text(format!(
            "Subagent {} failed: {}",
            call.tool, detail
        ))],
        Some(call.id.clone()),
    ))
}

/// Final text of a reasoning item: accumulated deltas, else its summary and content
pub fn reasoning_text(item: &ReasoningItem, accumulated: &str) -> String {
    if !accumulated.is_empty() {
        return accumulated.to_string();
    }
    item.summary
        .iter()
        .chain(item.content.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic assistant message id for an item
pub fn message_id(item_id: &str) -> String {
    format!("msg_{}", item_id)
}

// ============================================================================
// Durations
// ============================================================================

/// `2.5s` from 1000 ms upwards, `350ms` below
pub fn format_duration(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

/// Append a duration suffix unless it is below the noise floor
pub fn with_duration(text: &str, elapsed: Duration, floor_ms: u64) -> String {
    let ms = elapsed.as_millis() as u64;
    if ms < floor_ms {
        return text.to_string();
    }
    format!("{}\n(took {})", text.trim_end(), format_duration(ms))
}

// ============================================================================
// Plans
// ============================================================================

/// Status of a todo item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// A todo item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
    #[serde(rename = "activeForm")]
    pub active_form: String,
}

impl TodoItem {
    fn new(content: &str, status: TodoStatus) -> Self {
        Self {
            content: content.to_string(),
            status,
            active_form: content.to_string(),
        }
    }
}

/// One step of `turn/plan/updated`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlanStep {
    pub step: String,
    pub status: String,
}

pub fn todos_from_steps(steps: &[PlanStep]) -> Vec<TodoItem> {
    steps
        .iter()
        .filter(|s| !s.step.trim().is_empty())
        .map(|s| {
            let status = match s.status.as_str() {
                "completed" => TodoStatus::Completed,
                "inProgress" | "in_progress" => TodoStatus::InProgress,
                _ => TodoStatus::Pending,
            };
            TodoItem::new(s.step.trim(), status)
        })
        .collect()
}

/// Parse a markdown checklist (`- [ ]`, `- [x]`, `* [~]`) or numbered list
pub fn parse_plan_markdown(text: &str) -> Vec<TodoItem> {
    let mut todos = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        let rest = if let Some(rest) = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .or_else(|| line.strip_prefix("+ "))
        {
            rest
        } else if let Some(rest) = strip_numbered(line) {
            rest
        } else {
            continue;
        };

        let rest = rest.trim_start();
        let (status, content) = if let Some(c) = rest.strip_prefix("[ ]") {
            (TodoStatus::Pending, c)
        } else if let Some(c) = rest.strip_prefix("[x]").or_else(|| rest.strip_prefix("[X]")) {
            (TodoStatus::Completed, c)
        } else if let Some(c) = rest.strip_prefix("[~]").or_else(|| rest.strip_prefix("[-]")) {
            (TodoStatus::InProgress, c)
        } else {
            (TodoStatus::Pending, rest)
        };

        let content = content.trim();
        if !content.is_empty() {
            todos.push(TodoItem::new(content, status));
        }
    }

    todos
}

fn strip_numbered(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

/// TodoWrite block carrying a todo list
pub fn todo_write_block(id: impl Into<String>, todos: &[TodoItem]) -> ContentBlock {
    ContentBlock::tool_use(id, "TodoWrite", json!({ "todos": todos }))
}

// ============================================================================
// Turns, usage and rate limits
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnError {
    pub message: String,
}

/// Turn payload of `turn/started` and `turn/completed`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnInfo {
    pub id: String,
    pub status: String,
    pub error: Option<TurnError>,
}

/// Map a completed turn to the canonical `result`
pub fn turn_result(
    session_id: &str,
    turn: &TurnInfo,
    duration_ms: u64,
    num_turns: u32,
    usage: Option<TokenUsage>,
) -> CanonicalMessage {
    let (subtype, is_error, result) = match turn.status.as_str() {
        "failed" => (
            "error_during_execution",
            true,
            turn.error
                .as_ref()
                .map(|e| e.message.clone())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Turn failed".to_string()),
        ),
        "interrupted" => ("error_during_execution", true, "Interrupted".to_string()),
        _ => ("success", false, String::new()),
    };

    CanonicalMessage::Result {
        session_id: session_id.to_string(),
        subtype: subtype.to_string(),
        is_error,
        result,
        duration_ms,
        num_turns,
        usage,
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenBreakdown {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_output_tokens: u64,
}

impl From<TokenBreakdown> for TokenUsage {
    fn from(b: TokenBreakdown) -> Self {
        TokenUsage {
            input_tokens: b.input_tokens,
            output_tokens: b.output_tokens,
            cached_input_tokens: b.cached_input_tokens,
        }
    }
}

/// Payload of `thread/tokenUsage/updated`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThreadTokenUsage {
    pub total: TokenBreakdown,
    pub last: TokenBreakdown,
    pub model_context_window: Option<u64>,
}

/// round(100 * (last input + last output) / window), from the last turn only
pub fn context_used_percent(last: &TokenUsage, context_window: Option<u64>) -> Option<u32> {
    let window = context_window.filter(|w| *w > 0)?;
    let used = last.input_tokens + last.output_tokens;
    Some((100.0 * used as f64 / window as f64).round() as u32)
}

fn rate_limit_window(value: &Value) -> Option<RateLimitWindow> {
    let used_percent = value.get("usedPercent").and_then(|v| v.as_f64())?;
    Some(RateLimitWindow {
        used_percent,
        window_minutes: value.get("windowDurationMins").and_then(|v| v.as_u64()),
        resets_at: value.get("resetsAt").and_then(|v| v.as_i64()),
    })
}

/// Parse a rate-limit payload, bare or wrapped in `rateLimits`
pub fn rate_limits(value: &Value) -> Option<RateLimitSnapshot> {
    let limits = value.get("rateLimits").unwrap_or(value);
    if !limits.is_object() {
        return None;
    }
    let snapshot = RateLimitSnapshot {
        primary: limits.get("primary").and_then(rate_limit_window),
        secondary: limits.get("secondary").and_then(rate_limit_window),
    };
    if snapshot.primary.is_none() && snapshot.secondary.is_none() {
        return None;
    }
    Some(snapshot)
}
