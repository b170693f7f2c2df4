//! Configuration for the bridge
//!
//! Settings normally come from the host application; they can also be
//! loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sandbox requested from the agent. Always the most permissive; the
/// UI-facing permission mode is enforced by the bridge, not by the agent.
pub const UPSTREAM_SANDBOX: &str = "danger-full-access";

/// Approval policy requested from the agent
pub const UPSTREAM_APPROVAL_POLICY: &str = "never";

/// Permission mode as the UI sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    Plan,
    AcceptEdits,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::Plan => "plan",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    /// Collaboration mode requested upstream for this permission mode
    pub fn collaboration_mode(&self) -> CollaborationMode {
        match self {
            PermissionMode::Plan => CollaborationMode::Plan,
            _ => CollaborationMode::Default,
        }
    }
}

/// Agent-side collaboration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationMode {
    #[default]
    Default,
    Plan,
}

impl CollaborationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaborationMode::Default => "default",
            CollaborationMode::Plan => "plan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" | "code" => Some(CollaborationMode::Default),
            "plan" => Some(CollaborationMode::Plan),
            _ => None,
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            CollaborationMode::Default => CollaborationMode::Plan,
            CollaborationMode::Plan => CollaborationMode::Default,
        }
    }

    /// The UI permission mode that reflects this collaboration mode
    pub fn permission_mode(&self) -> PermissionMode {
        match self {
            CollaborationMode::Plan => PermissionMode::Plan,
            CollaborationMode::Default => PermissionMode::Default,
        }
    }
}

/// Backoff for retrying the thread call during the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt; later attempts wait longer
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Timeouts used by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Ordinary calls (turn start, MCP management)
    pub rpc_ms: u64,
    /// Each call of the initialization handshake
    pub handshake_ms: u64,
    /// How long a dynamic tool call may wait for an answer
    pub dynamic_tool_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_ms: 30_000,
            handshake_ms: 60_000,
            dynamic_tool_ms: 120_000,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Session id reported to the UI
    pub session_id: String,
    /// Working directory for the agent
    pub cwd: PathBuf,
    /// Model override (agent default when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thread to resume instead of starting fresh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_thread_id: Option<String>,
    /// UI-facing permission mode at startup
    pub permission_mode: PermissionMode,
    /// Client name sent during initialize
    pub client_name: String,
    /// Client version sent during initialize
    pub client_version: String,
    /// Retry policy for the thread call
    pub retry: RetryPolicy,
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// Command durations below this are not appended to results
    pub command_duration_floor_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            cwd: std::env::current_dir().unwrap_or_default(),
            model: None,
            resume_thread_id: None,
            permission_mode: PermissionMode::Default,
            client_name: "agentlink".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
            command_duration_floor_ms: 100,
        }
    }
}

impl BridgeConfig {
    /// Create a config for the given working directory
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    /// Set the session id
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Resume an existing thread
    pub fn with_resume_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.resume_thread_id = Some(thread_id.into());
        self
    }

    /// Set the startup permission mode
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.rpc_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handshake_ms)
    }

    pub fn dynamic_tool_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.dynamic_tool_ms)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `<config dir>/agentlink/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("agentlink").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_after(1), Duration::from_millis(500));
        assert_eq!(retry.delay_after(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_collaboration_mode_toggle() {
        assert_eq!(CollaborationMode::Plan.toggled(), CollaborationMode::Default);
        assert_eq!(CollaborationMode::Default.toggled(), CollaborationMode::Plan);
        assert_eq!(CollaborationMode::parse("plan"), Some(CollaborationMode::Plan));
        assert_eq!(CollaborationMode::parse("bogus"), None);
        assert_eq!(PermissionMode::Plan.collaboration_mode(), CollaborationMode::Plan);
    }
}
