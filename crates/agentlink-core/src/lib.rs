//! agentlink core - bridge between a coding-agent process and a UI
//!
//! This crate provides:
//! - The protocol bridge state machine (handshake, queueing, reconnection)
//! - Translation of agent items and turns into canonical messages
//! - Routing of approval requests to one permission model
//! - Canonical and UI message types
//! - Configuration and errors

pub mod approval;
pub mod bridge;
pub mod config;
pub mod error;
pub mod messages;
pub mod registry;
pub mod state;
pub mod translator;

pub use approval::{Approval, Decision, PendingPermission, PendingPermissions, PLAN_EXIT_TOOL};
pub use bridge::{Bridge, BridgeStatus, EventReceiver, SessionObserver};
pub use config::{
    BridgeConfig, CollaborationMode, PermissionMode, RetryPolicy, TimeoutConfig,
    UPSTREAM_APPROVAL_POLICY, UPSTREAM_SANDBOX,
};
pub use error::{Error, Result};
pub use messages::{
    AssistantMessage, CanonicalMessage, ContentBlock, PermissionBehavior, PermissionRequest,
    RateLimitSnapshot, SessionStatus, SessionUpdate, TokenUsage, UiMessage,
};
pub use registry::BridgeRegistry;

// Transport re-exports so hosts need only this crate
pub use agentlink_rpc::{FrameObserver, RpcPeer, Transport};
