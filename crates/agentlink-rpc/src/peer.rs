//! Duplex JSON-RPC peer
//!
//! `RpcPeer` owns one reader task and one writer task for a [`Transport`].
//! Outbound calls are correlated with their responses through a pending-call
//! table keyed by request id. Inbound notifications and requests are handed
//! to a single consumer through the incoming channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use crate::transport::{BoxedReader, BoxedWriter, Transport};

/// Longest line accepted from the remote (command output can be large)
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors surfaced by [`RpcPeer`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("Transport closed")]
    TransportClosed,

    #[error("Request '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("Remote error in '{method}': {message} (code {code})")]
    Remote {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Errors that may go away if the same call is retried.
    ///
    /// Includes remote errors reporting that the agent's own upstream
    /// connection closed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::TransportClosed => true,
            RpcError::Remote { message, .. } => {
                let message = message.to_ascii_lowercase();
                message.contains("transport closed") || message.contains("connection closed")
            }
            _ => false,
        }
    }
}

/// Observer for raw frames, for recording and debugging only
pub trait FrameObserver: Send + Sync {
    fn incoming(&self, frame: &str);
    fn outgoing(&self, frame: &str);
}

/// Inbound traffic that is not a response to one of our calls
#[derive(Debug, Clone)]
pub enum Incoming {
    Notification {
        method: String,
        params: Value,
    },
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// The stream ended; delivered exactly once, always last
    Closed,
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// State shared between the handle and its I/O tasks
struct Shared {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    connected: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
}

impl Shared {
    fn resolve(&self, response: JsonRpcResponse) {
        let Some(call) = self.pending.lock().remove(&response.id) else {
            warn!("Response for unknown request id {}", response.id);
            return;
        };

        let outcome = match response.error {
            Some(err) => Err(RpcError::Remote {
                method: call.method,
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = call.reply.send(outcome);
    }

    /// Reject every outstanding call and announce the closure once
    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            debug!("Rejecting {} pending call(s) on close", drained.len());
        }
        for call in drained {
            let _ = call.reply.send(Err(RpcError::TransportClosed));
        }

        let _ = self.incoming_tx.send(Incoming::Closed);
    }
}

/// Reply future for a call that has already been written
pub struct PendingReply {
    id: RequestId,
    method: String,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    shared: Arc<Shared>,
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, giving up after `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<Value, RpcError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::TransportClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&self.id);
                Err(RpcError::Timeout {
                    method: self.method,
                    timeout,
                })
            }
        }
    }
}

/// JSON-RPC peer over a duplex line stream
pub struct RpcPeer {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<String>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    next_id: AtomicI64,
    observer: Option<Arc<dyn FrameObserver>>,
    child: Mutex<Option<Child>>,
    shutdown: CancellationToken,
    label: String,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl RpcPeer {
    /// Start the I/O tasks for `transport`. Must be called inside a tokio runtime.
    pub fn start(transport: Transport, observer: Option<Arc<dyn FrameObserver>>) -> Arc<Self> {
        let label = transport.label().to_string();
        let (reader, writer, child) = transport.into_parts();

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            incoming_tx,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            reader,
            shared.clone(),
            observer.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(writer, outgoing_rx, shared.clone(), shutdown.clone()));

        debug!("RPC peer started: {}", label);

        Arc::new(Self {
            shared,
            outgoing: outgoing_tx,
            incoming: Mutex::new(Some(incoming_rx)),
            next_id: AtomicI64::new(1),
            observer,
            child: Mutex::new(child),
            shutdown,
            label,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The frame observer this peer was started with
    pub fn observer(&self) -> Option<Arc<dyn FrameObserver>> {
        self.observer.clone()
    }

    /// Take the incoming channel. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Incoming>> {
        self.incoming.lock().take()
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn write_frame(&self, frame: String) -> Result<(), RpcError> {
        if !self.is_connected() {
            return Err(RpcError::TransportClosed);
        }
        if let Some(observer) = &self.observer {
            observer.outgoing(&frame);
        }
        trace!("-> {}", frame);
        self.outgoing
            .send(frame)
            .map_err(|_| RpcError::TransportClosed)
    }

    /// Write a request now and return a future for its reply.
    ///
    /// Frames are written in the order `start_call` is invoked.
    pub fn start_call(&self, method: &str, params: Value) -> Result<PendingReply, RpcError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id.clone(), method).with_params(params);
        let frame =
            serde_json::to_string(&request).map_err(|e| RpcError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                reply: tx,
            },
        );

        if let Err(e) = self.write_frame(frame) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        Ok(PendingReply {
            id,
            method: method.to_string(),
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Call a remote method and wait for its result
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.start_call(method, params)?.wait(timeout).await
    }

    /// Send a notification (no response expected)
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let notification = JsonRpcNotification {
            method: method.to_string(),
            params: Some(params),
        };
        let frame =
            serde_json::to_string(&notification).map_err(|e| RpcError::Protocol(e.to_string()))?;
        self.write_frame(frame)
    }

    /// Reply to an inbound request
    pub fn respond(&self, id: RequestId, result: Value) -> Result<(), RpcError> {
        let frame = serde_json::to_string(&JsonRpcResponse::success(id, result))
            .map_err(|e| RpcError::Protocol(e.to_string()))?;
        self.write_frame(frame)
    }

    /// Stop the I/O tasks and kill the child process, if any
    pub fn close(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill agent process: {}", e);
            }
        }
        self.shutdown.cancel();
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    reader: BoxedReader,
    shared: Arc<Shared>,
    observer: Option<Arc<dyn FrameObserver>>,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Dropping oversized frame from agent");
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!("Read error from agent: {}", e);
                break;
            }
            None => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(observer) = &observer {
            observer.incoming(trimmed);
        }
        trace!("<- {}", trimmed);

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping unparseable frame: {}", e);
                continue;
            }
        };

        match Message::from_value(value) {
            Some(Message::Response(response)) => shared.resolve(response),
            Some(Message::Notification(n)) => {
                let _ = shared.incoming_tx.send(Incoming::Notification {
                    method: n.method,
                    params: n.params.unwrap_or(Value::Null),
                });
            }
            Some(Message::Request(r)) => {
                let _ = shared.incoming_tx.send(Incoming::Request {
                    id: r.id,
                    method: r.method,
                    params: r.params.unwrap_or(Value::Null),
                });
            }
            None => warn!("Skipping frame that is not a JSON-RPC envelope"),
        }
    }

    shared.close();
}

async fn write_loop(
    writer: BoxedWriter,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outgoing.recv() => frame,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = sink.send(frame).await {
            debug!("Write error to agent: {}", e);
            shared.close();
            break;
        }
    }
}
