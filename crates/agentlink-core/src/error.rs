//! Error types for agentlink core

use agentlink_rpc::RpcError;
use thiserror::Error;

/// Result type alias using agentlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// agentlink error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected response from agent: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown permission request: {0}")]
    UnknownPermission(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Text suitable for showing to a user.
    ///
    /// Transport failures and timeouts never leak their raw strings.
    pub fn friendly_message(&self) -> String {
        match self {
            Error::Rpc(e) => friendly_rpc_message(e),
            Error::Handshake(detail) => {
                format!("Could not start a session with the agent: {}", detail)
            }
            other => other.to_string(),
        }
    }

    /// Whether this error came from the transport going away
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Rpc(e) if e.is_transient())
    }
}

/// Map an RPC failure to user-facing text
pub fn friendly_rpc_message(error: &RpcError) -> String {
    match error {
        RpcError::TransportClosed => "Connection to the agent was lost.".to_string(),
        RpcError::Timeout { .. } => "The agent is not responding.".to_string(),
        RpcError::Remote { message, .. } => message.clone(),
        RpcError::Protocol(detail) => format!("The agent sent an invalid message: {}", detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_friendly_messages_hide_raw_transport_errors() {
        let closed: Error = RpcError::TransportClosed.into();
        assert_eq!(closed.friendly_message(), "Connection to the agent was lost.");
        assert!(closed.is_transient());

        let timeout: Error = RpcError::Timeout {
            method: "turn/start".into(),
            timeout: Duration::from_secs(30),
        }
        .into();
        assert_eq!(timeout.friendly_message(), "The agent is not responding.");
        assert!(!timeout.is_transient());
    }

    #[test]
    fn test_remote_error_surfaces_remote_text() {
        let err: Error = RpcError::Remote {
            method: "turn/start".into(),
            code: -32000,
            message: "model not available".into(),
            data: None,
        }
        .into();
        assert_eq!(err.friendly_message(), "model not available");
    }
}
