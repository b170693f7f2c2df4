//! agentlink RPC - duplex JSON-RPC over newline-delimited streams
//!
//! This crate provides the transport half of the bridge: spawning or
//! connecting to an agent process, correlating calls with responses,
//! and delivering the remote's notifications and requests.

pub mod peer;
pub mod protocol;
pub mod transport;

pub use peer::{FrameObserver, Incoming, PendingReply, RpcError, RpcPeer};
pub use protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};
pub use transport::Transport;
