//! Protocol bridge
//!
//! A [`Bridge`] owns one agent connection ([`RpcPeer`]) at a time. It runs
//! the initialization handshake, applies every inbound notification and
//! request to its state tables, and emits [`CanonicalMessage`]s on an
//! unbounded channel in the order they are produced.
//!
//! All state lives behind one `parking_lot::Mutex` that is never held across
//! an await. Inbound events are applied by a pump task per attached peer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agentlink_rpc::{Incoming, RequestId, RpcError, RpcPeer};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::approval::{tool_call_reply, Approval, Decision, PendingPermission, PendingPermissions};
use crate::config::{
    BridgeConfig, CollaborationMode, PermissionMode, UPSTREAM_APPROVAL_POLICY, UPSTREAM_SANDBOX,
};
use crate::error::{friendly_rpc_message, Error, Result};
use crate::messages::{
    CanonicalMessage, ContentBlock, PermissionBehavior, RateLimitSnapshot, SessionStatus,
    SessionUpdate, UiMessage,
};
use crate::state::{AccountState, ItemKind, ItemTable, OpenItem, SessionThread, SubagentMap, UsageSnapshot};
use crate::translator::{self, PlanStep, ThreadItem, ThreadTokenUsage, TurnInfo};

/// Receiver for the bridge's canonical output
pub type EventReceiver = mpsc::UnboundedReceiver<CanonicalMessage>;

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Disconnected,
}

/// Persistence hook, told about the agent thread once it is known.
///
/// Called with the bridge state locked; implementations must not call back
/// into the bridge.
pub trait SessionObserver: Send + Sync {
    fn thread_started(&self, session_id: &str, thread_id: &str);
}

struct BridgeState {
    status: BridgeStatus,
    peer: Arc<RpcPeer>,
    /// Bumped on every reconnect; upstream request ids are only valid
    /// within one connection
    connection: u64,
    pump: Option<JoinHandle<()>>,
    session: SessionThread,
    model: Option<String>,
    permission_mode: PermissionMode,
    items: ItemTable,
    subagents: SubagentMap,
    /// Tool-use and message ids already emitted
    announced: HashSet<String>,
    command_timers: HashMap<String, Instant>,
    permissions: PendingPermissions,
    tool_timers: HashMap<String, AbortHandle>,
    queue: VecDeque<UiMessage>,
    account: AccountState,
    plan_text: String,
    plan_updates: u32,
    turn_active: bool,
    interrupt_requested: bool,
    turn_started_at: Option<Instant>,
    num_turns: u32,
    disconnect_signaled: bool,
}

impl BridgeState {
    fn new(config: &BridgeConfig, peer: Arc<RpcPeer>) -> Self {
        Self {
            status: BridgeStatus::Uninitialized,
            peer,
            connection: 0,
            pump: None,
            session: SessionThread {
                thread_id: None,
                turn_id: None,
                collaboration_mode: config.permission_mode.collaboration_mode(),
            },
            model: config.model.clone(),
            permission_mode: config.permission_mode,
            items: ItemTable::new(),
            subagents: SubagentMap::new(),
            announced: HashSet::new(),
            command_timers: HashMap::new(),
            permissions: PendingPermissions::new(),
            tool_timers: HashMap::new(),
            queue: VecDeque::new(),
            account: AccountState::default(),
            plan_text: String::new(),
            plan_updates: 0,
            turn_active: false,
            interrupt_requested: false,
            turn_started_at: None,
            num_turns: 0,
            disconnect_signaled: false,
        }
    }

    fn parent_for(&self, thread_id: Option<&str>) -> Option<String> {
        thread_id
            .and_then(|t| self.subagents.parent_of(t))
            .map(String::from)
    }

    fn abort_tool_timers(&mut self) {
        for (_, timer) in self.tool_timers.drain() {
            timer.abort();
        }
    }
}

struct Handshake {
    thread_id: String,
    model: Option<String>,
}

struct BridgeInner {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    events: mpsc::UnboundedSender<CanonicalMessage>,
    observer: Option<Arc<dyn SessionObserver>>,
}

/// Bridge between one agent connection and the canonical protocol
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("session_id", &self.inner.config.session_id)
            .field("status", &self.status())
            .finish()
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn spawn_pump(inner: &Arc<BridgeInner>, peer: &Arc<RpcPeer>) -> Option<JoinHandle<()>> {
    let Some(mut incoming) = peer.take_incoming() else {
        warn!("Incoming channel of {} was already taken", peer.label());
        return None;
    };
    let weak_inner = Arc::downgrade(inner);
    let weak_peer = Arc::downgrade(peer);

    Some(tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            let Some(inner) = weak_inner.upgrade() else { break };
            match event {
                Incoming::Notification { method, params } => inner.on_notification(&method, &params),
                Incoming::Request { id, method, params } => inner.on_request(id, &method, &params),
                Incoming::Closed => {
                    if let Some(peer) = weak_peer.upgrade() {
                        inner.on_transport_closed(&peer);
                    }
                    break;
                }
            }
        }
    }))
}

impl Bridge {
    /// Create a bridge over `peer`. Inbound traffic is consumed immediately;
    /// call [`Bridge::initialize`] to run the handshake.
    pub fn new(config: BridgeConfig, peer: Arc<RpcPeer>) -> (Self, EventReceiver) {
        Self::with_observer(config, peer, None)
    }

    /// Create a bridge with a persistence hook
    pub fn with_observer(
        config: BridgeConfig,
        peer: Arc<RpcPeer>,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = BridgeState::new(&config, peer.clone());
        let inner = Arc::new(BridgeInner {
            config,
            state: Mutex::new(state),
            events,
            observer,
        });

        let pump = spawn_pump(&inner, &peer);
        inner.state.lock().pump = pump;

        (Self { inner }, rx)
    }

    /// Identity comparison
    pub fn ptr_eq(a: &Bridge, b: &Bridge) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn session_id(&self) -> &str {
        &self.inner.config.session_id
    }

    pub fn status(&self) -> BridgeStatus {
        self.inner.state.lock().status
    }

    pub fn thread_id(&self) -> Option<String> {
        self.inner.state.lock().session.thread_id.clone()
    }

    pub fn model(&self) -> Option<String> {
        self.inner.state.lock().model.clone()
    }

    pub fn collaboration_mode(&self) -> CollaborationMode {
        self.inner.state.lock().session.collaboration_mode
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.inner.state.lock().permission_mode
    }

    /// The peer currently attached
    pub fn peer(&self) -> Arc<RpcPeer> {
        self.inner.state.lock().peer.clone()
    }

    pub fn pending_permissions(&self) -> usize {
        self.inner.state.lock().permissions.len()
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn open_items(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Parent tool-use id that items on `thread_id` are grouped under
    pub fn subagent_parent(&self, thread_id: &str) -> Option<String> {
        self.inner.state.lock().subagents.parent_of(thread_id).map(String::from)
    }

    /// Run the handshake.
    ///
    /// Resumes the known thread (or the configured resume id) when there is
    /// one. No-op if a handshake is already running or done.
    pub async fn initialize(&self) -> Result<()> {
        let (peer, resume, model) = {
            let mut st = self.inner.state.lock();
            match st.status {
                BridgeStatus::Uninitialized => {}
                BridgeStatus::Initializing | BridgeStatus::Ready => return Ok(()),
                BridgeStatus::Failed | BridgeStatus::Disconnected => {
                    return Err(Error::Handshake("the session is closed".to_string()));
                }
            }
            st.status = BridgeStatus::Initializing;
            let resume = st
                .session
                .thread_id
                .clone()
                .or_else(|| self.inner.config.resume_thread_id.clone());
            (st.peer.clone(), resume, st.model.clone())
        };

        info!("Initializing session {} over {}", self.session_id(), peer.label());

        match self.inner.handshake(&peer, resume, model).await {
            Ok(handshake) => {
                self.inner.finish_ready(&peer, handshake);
                self.inner.refresh_rate_limits(&peer);
                Ok(())
            }
            Err(e) => {
                self.inner.finish_failed(&peer, &e);
                Err(e)
            }
        }
    }

    /// Send a UI message.
    ///
    /// Returns whether the message was accepted. Queueable messages wait
    /// while the handshake runs; everything is rejected once the bridge
    /// has failed or disconnected.
    pub fn send_message(&self, msg: UiMessage) -> bool {
        let mut st = self.inner.state.lock();
        match st.status {
            BridgeStatus::Failed | BridgeStatus::Disconnected => {
                debug!("Rejecting {}: session is {:?}", msg.kind(), st.status);
                false
            }
            BridgeStatus::Uninitialized | BridgeStatus::Initializing => {
                if msg.is_queueable() {
                    trace!("Queueing {} until the session is ready", msg.kind());
                    st.queue.push_back(msg);
                    true
                } else if matches!(
                    msg,
                    UiMessage::PermissionResponse { .. } | UiMessage::ToolCallResponse { .. }
                ) {
                    self.inner.dispatch(&mut st, msg)
                } else {
                    debug!("{} is not supported before the session is ready", msg.kind());
                    false
                }
            }
            BridgeStatus::Ready => self.inner.dispatch(&mut st, msg),
        }
    }

    /// Swap in a new connection and re-run the handshake.
    ///
    /// Subagent mappings and pending permissions survive; the known thread
    /// is resumed. Permissions from the old connection can no longer be
    /// answered upstream and resolve as `stale`.
    pub async fn reset_for_reconnect(&self, peer: Arc<RpcPeer>) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if let Some(pump) = st.pump.take() {
                pump.abort();
            }
            let old = std::mem::replace(&mut st.peer, peer.clone());
            if old.is_connected() {
                old.close();
            }
            info!("Reconnecting session {}: {} -> {}", self.session_id(), old.label(), peer.label());
            st.connection += 1;

            st.abort_tool_timers();
            st.items.clear();
            st.command_timers.clear();
            st.turn_active = false;
            st.interrupt_requested = false;
            st.session.turn_id = None;
            st.status = BridgeStatus::Uninitialized;
            st.disconnect_signaled = false;
            st.pump = spawn_pump(&self.inner, &peer);
        }
        self.initialize().await
    }

    /// Tear the session down.
    ///
    /// Cancels dynamic tool timers and every pending permission, closes the
    /// connection, and emits `disconnected` unless it was already emitted.
    pub fn disconnect(&self) {
        let mut st = self.inner.state.lock();
        st.abort_tool_timers();
        for entry in st.permissions.drain() {
            self.inner
                .emit(CanonicalMessage::permission_cancelled(entry.request_id, "disconnected"));
        }
        if let Some(pump) = st.pump.take() {
            pump.abort();
        }
        st.peer.close();
        st.queue.clear();
        if st.status != BridgeStatus::Failed {
            st.status = BridgeStatus::Disconnected;
        }
        self.inner.signal_disconnect(&mut st, Some("Session closed".to_string()));
    }
}

impl BridgeInner {
    fn emit(&self, msg: CanonicalMessage) {
        trace!("emit {}", msg.kind());
        if self.events.send(msg).is_err() {
            trace!("Event receiver dropped");
        }
    }

    fn emit_update(&self, update: SessionUpdate) {
        self.emit(CanonicalMessage::SessionUpdate {
            session_id: self.config.session_id.clone(),
            update,
        });
    }

    fn signal_disconnect(&self, st: &mut BridgeState, reason: Option<String>) {
        if st.disconnect_signaled {
            return;
        }
        st.disconnect_signaled = true;
        self.emit(CanonicalMessage::Disconnected { reason });
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    async fn handshake(
        &self,
        peer: &Arc<RpcPeer>,
        resume: Option<String>,
        model: Option<String>,
    ) -> Result<Handshake> {
        let timeout = self.config.handshake_timeout();
        peer.call(
            "initialize",
            json!({
                "clientInfo": {
                    "name": self.config.client_name,
                    "title": self.config.client_name,
                    "version": self.config.client_version,
                }
            }),
            timeout,
        )
        .await?;
        peer.notify("initialized", json!({}))?;

        let response = self.open_thread(peer, resume, model.as_deref()).await?;
        let thread_id = response
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| Error::UnexpectedResponse("thread response has no thread id".into()))?
            .to_string();

        Ok(Handshake {
            thread_id,
            model: model.or_else(|| str_param(&response, "model").map(String::from)),
        })
    }

    fn thread_params(&self, resume: Option<&str>, model: Option<&str>) -> Value {
        let mut params = json!({
            "cwd": self.config.cwd.display().to_string(),
            "sandbox": UPSTREAM_SANDBOX,
            "approvalPolicy": UPSTREAM_APPROVAL_POLICY,
        });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        if let Some(thread_id) = resume {
            params["threadId"] = json!(thread_id);
        }
        params
    }

    /// `thread/start` or `thread/resume`, retrying transient failures
    async fn open_thread(
        &self,
        peer: &Arc<RpcPeer>,
        resume: Option<String>,
        model: Option<&str>,
    ) -> Result<Value> {
        let retry = &self.config.retry;
        let attempts = retry.attempts.max(1);
        let timeout = self.config.handshake_timeout();
        let mut resume = resume;
        let mut attempt = 1;

        loop {
            let method = if resume.is_some() { "thread/resume" } else { "thread/start" };
            let params = self.thread_params(resume.as_deref(), model);

            match peer.call(method, params, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        method,
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e @ RpcError::Remote { .. }) if resume.is_some() && !e.is_transient() => {
                    warn!("Could not resume thread ({}); starting a new one", e);
                    resume = None;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish_ready(self: &Arc<Self>, peer: &Arc<RpcPeer>, handshake: Handshake) {
        let mut st = self.state.lock();
        if !Arc::ptr_eq(&st.peer, peer) || st.status != BridgeStatus::Initializing {
            debug!("Handshake finished on a connection that is no longer current");
            return;
        }

        st.status = BridgeStatus::Ready;
        st.session.thread_id = Some(handshake.thread_id.clone());
        if handshake.model.is_some() {
            st.model = handshake.model;
        }
        info!("Session {} ready on thread {}", self.config.session_id, handshake.thread_id);

        self.emit(CanonicalMessage::SessionInit {
            session_id: self.config.session_id.clone(),
            thread_id: handshake.thread_id.clone(),
            model: st.model.clone(),
            cwd: self.config.cwd.display().to_string(),
            permission_mode: st.permission_mode,
        });
        if let Some(observer) = &self.observer {
            observer.thread_started(&self.config.session_id, &handshake.thread_id);
        }

        let queued: Vec<UiMessage> = st.queue.drain(..).collect();
        if !queued.is_empty() {
            debug!("Flushing {} queued message(s)", queued.len());
        }
        for msg in queued {
            let kind = msg.kind();
            if !self.dispatch(&mut st, msg) {
                debug!("Queued {} was not accepted", kind);
            }
        }

        self.emit(CanonicalMessage::Connected);
    }

    fn finish_failed(&self, peer: &Arc<RpcPeer>, error: &Error) {
        let mut st = self.state.lock();
        if !Arc::ptr_eq(&st.peer, peer) {
            debug!("Ignoring handshake failure on a superseded connection: {}", error);
            return;
        }

        warn!("Handshake failed for session {}: {}", self.config.session_id, error);
        if st.status == BridgeStatus::Initializing {
            st.status = BridgeStatus::Failed;
        }
        let discarded = st.queue.len();
        st.queue.clear();
        if discarded > 0 {
            debug!("Discarded {} queued message(s)", discarded);
        }
        self.emit(CanonicalMessage::error(error.friendly_message()));
    }

    /// Best-effort trailing rate-limit fetch
    fn refresh_rate_limits(self: &Arc<Self>, peer: &Arc<RpcPeer>) {
        let reply = match peer.start_call("account/rateLimits/read", json!({})) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Skipping rate limit read: {}", e);
                return;
            }
        };
        let weak = Arc::downgrade(self);
        let timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            match reply.wait(timeout).await {
                Ok(value) => {
                    if let Some(inner) = weak.upgrade()
                        && let Some(limits) = translator::rate_limits(&value)
                    {
                        inner.store_rate_limits(limits);
                    }
                }
                Err(e) => debug!("Rate limit read failed: {}", e),
            }
        });
    }

    fn store_rate_limits(&self, limits: RateLimitSnapshot) {
        self.state.lock().account.rate_limits = Some(limits.clone());
        self.emit_update(SessionUpdate {
            rate_limits: Some(limits),
            ..Default::default()
        });
    }

    // ------------------------------------------------------------------------
    // UI messages
    // ------------------------------------------------------------------------

    fn dispatch(self: &Arc<Self>, st: &mut BridgeState, msg: UiMessage) -> bool {
        match msg {
            UiMessage::UserMessage { content } => self.start_turn(st, content),
            UiMessage::Interrupt => self.interrupt(st),
            UiMessage::PermissionResponse {
                request_id,
                behavior,
                message,
                answers,
                ..
            } => {
                let Some(entry) = st.permissions.take(&request_id) else {
                    warn!("{}", Error::UnknownPermission(request_id));
                    return false;
                };
                self.finish_permission(st, entry, Decision::from_response(behavior, message, answers))
            }
            UiMessage::ToolCallResponse {
                call_id,
                success,
                output,
            } => {
                let Some(entry) = st.permissions.take_by_call_id(&call_id) else {
                    warn!("No pending tool call {}", call_id);
                    return false;
                };
                let decision = if success {
                    Decision::allow()
                } else {
                    Decision::deny(None)
                };
                self.finish_permission(st, entry, decision.with_output(output))
            }
            UiMessage::McpGetStatus => self.mcp_calls(st, Vec::new()),
            UiMessage::McpReload => {
                self.mcp_calls(st, vec![("config/mcpServer/reload", json!({}))])
            }
            UiMessage::McpToggle { server, enabled } => self.mcp_calls(
                st,
                vec![
                    (
                        "config/value/write",
                        json!({
                            "keyPath": format!("mcp_servers.{}.enabled", server),
                            "value": enabled,
                            "mergeStrategy": "upsert",
                        }),
                    ),
                    ("config/mcpServer/reload", json!({})),
                ],
            ),
            UiMessage::SetPermissionMode { mode } => {
                st.permission_mode = mode;
                st.session.collaboration_mode = mode.collaboration_mode();
                self.emit_update(SessionUpdate {
                    permission_mode: Some(mode),
                    ..Default::default()
                });
                true
            }
            UiMessage::SetModel { model } => {
                st.model = Some(model.clone());
                self.emit_update(SessionUpdate {
                    model: Some(model),
                    ..Default::default()
                });
                true
            }
        }
    }

    fn start_turn(self: &Arc<Self>, st: &mut BridgeState, content: String) -> bool {
        let Some(thread_id) = st.session.thread_id.clone() else {
            warn!("Cannot start a turn without a thread");
            return false;
        };

        let mut params = json!({
            "threadId": thread_id,
            "input": [{ "type": "text", "text": content }],
            "collaborationMode": { "mode": st.session.collaboration_mode.as_str() },
        });
        if let Some(model) = &st.model {
            params["model"] = json!(model);
        }

        let reply = match st.peer.start_call("turn/start", params) {
            Ok(reply) => reply,
            Err(e) => {
                self.emit(CanonicalMessage::error(friendly_rpc_message(&e)));
                return false;
            }
        };
        st.turn_active = true;

        let weak = Arc::downgrade(self);
        let timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            let outcome = reply.wait(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_turn_start_reply(outcome);
            }
        });
        true
    }

    fn on_turn_start_reply(self: &Arc<Self>, outcome: std::result::Result<Value, RpcError>) {
        let mut st = self.state.lock();
        match outcome {
            Ok(response) => {
                let turn_id = response
                    .get("turn")
                    .and_then(|t| t.get("id"))
                    .and_then(|id| id.as_str());
                if let Some(turn_id) = turn_id
                    && st.turn_active
                    && st.session.turn_id.is_none()
                {
                    st.session.turn_id = Some(turn_id.to_string());
                    if st.interrupt_requested {
                        self.send_interrupt(&mut st);
                    }
                }
            }
            Err(e) => {
                warn!("turn/start failed: {}", e);
                st.turn_active = false;
                st.interrupt_requested = false;
                self.emit(CanonicalMessage::error(friendly_rpc_message(&e)));
            }
        }
    }

    fn interrupt(self: &Arc<Self>, st: &mut BridgeState) -> bool {
        if !st.turn_active {
            debug!("No turn to interrupt");
            return false;
        }
        if st.session.turn_id.is_none() {
            debug!("Turn id not known yet; deferring interrupt");
            st.interrupt_requested = true;
            return true;
        }
        self.send_interrupt(st);
        true
    }

    /// Fire `turn/interrupt` without waiting for the acknowledgment
    fn send_interrupt(&self, st: &mut BridgeState) {
        st.interrupt_requested = false;
        let (Some(thread_id), Some(turn_id)) = (&st.session.thread_id, &st.session.turn_id) else {
            return;
        };
        let params = json!({ "threadId": thread_id, "turnId": turn_id });
        match st.peer.start_call("turn/interrupt", params) {
            Ok(reply) => {
                let timeout = self.config.rpc_timeout();
                tokio::spawn(async move {
                    if let Err(e) = reply.wait(timeout).await {
                        debug!("turn/interrupt was not acknowledged: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to send interrupt: {}", e),
        }
    }

    fn mcp_calls(self: &Arc<Self>, st: &mut BridgeState, steps: Vec<(&'static str, Value)>) -> bool {
        if !st.peer.is_connected() {
            return false;
        }
        let peer = st.peer.clone();
        let weak = Arc::downgrade(self);
        let timeout = self.config.rpc_timeout();

        tokio::spawn(async move {
            for (method, params) in steps {
                if let Err(e) = peer.call(method, params, timeout).await {
                    warn!("{} failed: {}", method, e);
                    if let Some(inner) = weak.upgrade() {
                        inner.emit(CanonicalMessage::error(friendly_rpc_message(&e)));
                    }
                    return;
                }
            }
            match peer.call("mcpServerStatus/list", json!({}), timeout).await {
                Ok(response) => {
                    let servers = response.get("data").cloned().unwrap_or(response);
                    if let Some(inner) = weak.upgrade() {
                        inner.emit(CanonicalMessage::McpStatus { servers });
                    }
                }
                Err(e) => {
                    warn!("mcpServerStatus/list failed: {}", e);
                    if let Some(inner) = weak.upgrade() {
                        inner.emit(CanonicalMessage::error(friendly_rpc_message(&e)));
                    }
                }
            }
        });
        true
    }

    // ------------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------------

    /// Send the one upstream reply for a pending permission. Returns false
    /// if the request came from a previous connection.
    fn finish_permission(
        &self,
        st: &mut BridgeState,
        entry: PendingPermission,
        decision: Decision,
    ) -> bool {
        if let Some(timer) = st.tool_timers.remove(&entry.request_id) {
            timer.abort();
        }
        if entry.connection != st.connection {
            warn!(
                "Permission {} was asked on a previous connection; not answering",
                entry.request_id
            );
            self.emit(CanonicalMessage::permission_cancelled(entry.request_id, "stale"));
            return false;
        }

        let reply = entry.approval.reply(&decision);
        if let Err(e) = st.peer.respond(entry.upstream_id, reply) {
            warn!("Failed to answer permission {}: {}", entry.request_id, e);
        }

        if entry.approval.is_plan_exit() && decision.allow {
            let mode = st.session.collaboration_mode.toggled();
            st.session.collaboration_mode = mode;
            st.permission_mode = mode.permission_mode();
            info!("Collaboration mode is now {}", mode.as_str());
            self.emit_update(SessionUpdate {
                permission_mode: Some(st.permission_mode),
                ..Default::default()
            });
        }
        true
    }

    fn on_request(self: &Arc<Self>, id: RequestId, method: &str, params: &Value) {
        let mut st = self.state.lock();

        let Some(approval) = Approval::from_request(method, params, &self.config) else {
            warn!("Auto-accepting unsupported request {}", method);
            if let Err(e) = st.peer.respond(id.clone(), json!({ "decision": "accept" })) {
                warn!("Failed to answer {}: {}", method, e);
            }
            self.emit(CanonicalMessage::PermissionAutoResolved {
                request_id: id.to_string(),
                tool_name: method.to_string(),
                behavior: PermissionBehavior::Allow,
                reason: "unsupported request".to_string(),
            });
            return;
        };

        let request_id = uuid::Uuid::new_v4().to_string();

        if approval.auto_approved_by(st.permission_mode) {
            debug!("{} auto-approved by {}", approval.tool_name(), st.permission_mode.as_str());
            if let Err(e) = st.peer.respond(id, approval.reply(&Decision::allow())) {
                warn!("Failed to answer {}: {}", method, e);
            }
            self.emit(CanonicalMessage::PermissionAutoResolved {
                request_id,
                tool_name: approval.tool_name(),
                behavior: PermissionBehavior::Allow,
                reason: format!("permission mode {}", st.permission_mode.as_str()),
            });
            return;
        }

        self.emit(CanonicalMessage::PermissionRequest {
            request: approval.permission_request(&request_id),
        });
        if approval.is_dynamic_tool() {
            self.arm_tool_timer(&mut st, &request_id);
        }
        let connection = st.connection;
        st.permissions.insert(PendingPermission {
            request_id,
            upstream_id: id,
            connection,
            approval,
        });
    }

    fn arm_tool_timer(self: &Arc<Self>, st: &mut BridgeState, request_id: &str) {
        let weak: Weak<BridgeInner> = Arc::downgrade(self);
        let timeout = self.config.dynamic_tool_timeout();
        let id = request_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_tool_call(&id, timeout);
            }
        });
        st.tool_timers.insert(request_id.to_string(), handle.abort_handle());
    }

    fn expire_tool_call(&self, request_id: &str, timeout: Duration) {
        let mut st = self.state.lock();
        st.tool_timers.remove(request_id);
        let Some(entry) = st.permissions.take(request_id) else {
            return;
        };
        if entry.connection != st.connection {
            self.emit(CanonicalMessage::permission_cancelled(request_id, "stale"));
            return;
        }

        warn!("Dynamic tool call {} timed out", request_id);
        let text = format!("Tool call timed out after {}s", timeout.as_secs());
        if let Err(e) = st.peer.respond(entry.upstream_id, tool_call_reply(false, &text)) {
            warn!("Failed to answer timed out tool call: {}", e);
        }

        let call_id = entry.approval.tool_use_id().unwrap_or_default();
        let thread = st.items.get(&call_id).and_then(|i| i.thread_id.clone());
        let parent = st.parent_for(thread.as_deref());
        self.emit(CanonicalMessage::assistant(
            format!("{}_result", translator::message_id(&call_id)),
            st.model.clone(),
            vec![ContentBlock::tool_result(&call_id, text, true)],
            parent,
        ));
        self.emit(CanonicalMessage::permission_cancelled(request_id, "timeout"));
    }

    /// The agent finished a dynamic tool call on its own
    fn settle_tool_call(&self, st: &mut BridgeState, call_id: &str) {
        let Some(entry) = st.permissions.take_by_call_id(call_id) else {
            return;
        };
        if let Some(timer) = st.tool_timers.remove(&entry.request_id) {
            timer.abort();
        }
        self.emit(CanonicalMessage::permission_cancelled(entry.request_id, "completed"));
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    fn on_notification(self: &Arc<Self>, method: &str, params: &Value) {
        let mut st = self.state.lock();
        match method {
            "item/started" => self.item_started(&mut st, params),
            "item/completed" => self.item_completed(&mut st, params),
            "item/agentMessage/delta" => self.text_delta(&mut st, params),
            "item/reasoning/textDelta" | "item/reasoning/summaryTextDelta" => {
                self.reasoning_delta(&mut st, params)
            }
            "item/plan/delta" => {
                if let (Some(id), Some(delta)) = (str_param(params, "itemId"), str_param(params, "delta")) {
                    st.items.append(id, ItemKind::Plan, delta);
                    st.plan_text.push_str(delta);
                }
            }
            "item/commandExecution/outputDelta" => self.command_output(&mut st, params),
            "turn/started" => self.turn_started(&mut st, params),
            "turn/completed" => self.turn_completed(&mut st, params),
            "turn/plan/updated" => self.plan_updated(&mut st, params),
            "thread/tokenUsage/updated" => self.token_usage(&mut st, params),
            "account/rateLimits/updated" => {
                if let Some(limits) = translator::rate_limits(params) {
                    st.account.rate_limits = Some(limits.clone());
                    self.emit_update(SessionUpdate {
                        rate_limits: Some(limits),
                        ..Default::default()
                    });
                }
            }
            "error" => {
                let will_retry = params.get("willRetry").and_then(|v| v.as_bool()).unwrap_or(false);
                let message = params
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .or_else(|| str_param(params, "message"))
                    .unwrap_or("The agent reported an error")
                    .to_string();
                if will_retry {
                    debug!("Agent error (retrying): {}", message);
                } else {
                    self.emit(CanonicalMessage::error(message));
                }
            }
            other => debug!("Unhandled notification: {}", other),
        }
    }

    /// Emit the tool_use for an item once per id
    fn announce_tool(&self, st: &mut BridgeState, item: &ThreadItem, parent: Option<String>) {
        let (Some(id), Some(block)) = (item.id(), translator::tool_use(item)) else {
            return;
        };
        if !st.announced.insert(id.to_string()) {
            return;
        }
        self.emit(CanonicalMessage::assistant(
            translator::message_id(id),
            st.model.clone(),
            vec![block],
            parent,
        ));
    }

    fn item_started(&self, st: &mut BridgeState, params: &Value) {
        let Some(item) = params.get("item").and_then(ThreadItem::parse) else {
            return;
        };
        let Some(id) = item.id().map(String::from) else {
            debug!("Ignoring item of unknown type");
            return;
        };
        let thread_id = str_param(params, "threadId").map(String::from);

        // An early delta may have opened a placeholder; that still counts as
        // the first start
        if !st.items.open(OpenItem::new(&id, item.kind(), thread_id.clone())) {
            debug!("Duplicate item/started for {}", id);
            return;
        }

        let parent = st.parent_for(thread_id.as_deref());
        match &item {
            ThreadItem::CommandExecution(_) => {
                st.command_timers.insert(id.clone(), Instant::now());
            }
            ThreadItem::CollabAgentToolCall(call) => {
                let sender = call.sender_thread_id.as_deref().or(thread_id.as_deref());
                st.subagents.register(&call.id, sender, &call.receiver_thread_ids);
            }
            ThreadItem::Reasoning(_) => {
                self.emit(CanonicalMessage::block_start("thinking", parent.clone()));
            }
            _ => {}
        }
        self.announce_tool(st, &item, parent);
    }

    fn item_completed(&self, st: &mut BridgeState, params: &Value) {
        let Some(item) = params.get("item").and_then(ThreadItem::parse) else {
            return;
        };
        let Some(id) = item.id().map(String::from) else {
            debug!("Ignoring completion of unknown item type");
            return;
        };

        let open = st.items.close(&id);
        let started = open.as_ref().is_some_and(|o| o.started);
        let thread_id = str_param(params, "threadId")
            .map(String::from)
            .or_else(|| open.as_ref().and_then(|o| o.thread_id.clone()));
        let accumulated = open.map(|o| o.text).unwrap_or_default();
        let parent = st.parent_for(thread_id.as_deref());

        // Completion without a start: the tool_use still goes first
        self.announce_tool(st, &item, parent.clone());

        let model = st.model.clone();
        match &item {
            ThreadItem::AgentMessage(msg) => {
                let text = if msg.text.is_empty() { accumulated } else { msg.text.clone() };
                let msg_id = translator::message_id(&id);
                if st.announced.insert(msg_id.clone()) {
                    self.emit(CanonicalMessage::assistant(
                        msg_id,
                        model,
                        vec![ContentBlock::text(text)],
                        parent,
                    ));
                }
            }
            ThreadItem::Reasoning(reasoning) => {
                if !started {
                    self.emit(CanonicalMessage::block_start("thinking", parent.clone()));
                }
                let thinking = translator::reasoning_text(reasoning, &accumulated);
                if !thinking.is_empty() {
                    self.emit(CanonicalMessage::assistant(
                        translator::message_id(&id),
                        model,
                        vec![ContentBlock::Thinking { thinking }],
                        parent.clone(),
                    ));
                }
                self.emit(CanonicalMessage::block_stop(parent));
            }
            ThreadItem::Plan(plan) => {
                let text = if plan.text.is_empty() { accumulated } else { plan.text.clone() };
                let todos = translator::parse_plan_markdown(&text);
                st.plan_text = text;
                if !todos.is_empty() && st.announced.insert(id.clone()) {
                    self.emit(CanonicalMessage::assistant(
                        translator::message_id(&id),
                        model,
                        vec![translator::todo_write_block(&id, &todos)],
                        parent,
                    ));
                }
            }
            ThreadItem::UserMessage(_) | ThreadItem::Unknown => {}
            _ => {
                let duration = st.command_timers.remove(&id).map(|start| start.elapsed());
                if let Some(block) =
                    translator::tool_result(&item, duration, self.config.command_duration_floor_ms)
                {
                    self.emit(CanonicalMessage::assistant(
                        format!("{}_result", translator::message_id(&id)),
                        model,
                        vec![block],
                        parent,
                    ));
                }
                if let ThreadItem::CollabAgentToolCall(call) = &item {
                    if let Some(summary) = translator::collab_failure_summary(call) {
                        self.emit(summary);
                    }
                    let cleared = st.subagents.clear(&call.id);
                    trace!("Cleared {} subagent thread(s) for {}", cleared, call.id);
                }
                if let ThreadItem::DynamicToolCall(call) = &item {
                    self.settle_tool_call(st, &call.id);
                }
            }
        }
    }

    fn delta_parent(&self, st: &BridgeState, item_id: &str, params: &Value) -> Option<String> {
        let thread = st
            .items
            .get(item_id)
            .and_then(|i| i.thread_id.clone())
            .or_else(|| str_param(params, "threadId").map(String::from));
        st.parent_for(thread.as_deref())
    }

    fn text_delta(&self, st: &mut BridgeState, params: &Value) {
        let (Some(id), Some(delta)) = (str_param(params, "itemId"), str_param(params, "delta")) else {
            return;
        };
        st.items.append(id, ItemKind::AgentMessage, delta);
        let parent = self.delta_parent(st, id, params);
        self.emit(CanonicalMessage::text_delta(delta, parent));
    }

    fn reasoning_delta(&self, st: &mut BridgeState, params: &Value) {
        let (Some(id), Some(delta)) = (str_param(params, "itemId"), str_param(params, "delta")) else {
            return;
        };
        st.items.append(id, ItemKind::Reasoning, delta);
        let parent = self.delta_parent(st, id, params);
        self.emit(CanonicalMessage::thinking_delta(delta, parent));
    }

    fn command_output(&self, st: &mut BridgeState, params: &Value) {
        let Some(id) = str_param(params, "itemId") else {
            return;
        };
        if let Some(delta) = str_param(params, "delta") {
            st.items.append(id, ItemKind::Command, delta);
        }
        let elapsed = st
            .command_timers
            .get(id)
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let parent = self.delta_parent(st, id, params);
        self.emit(CanonicalMessage::ToolProgress {
            tool_use_id: id.to_string(),
            tool_name: "Bash".to_string(),
            elapsed_time_seconds: elapsed,
            parent_tool_use_id: parent,
        });
    }

    fn turn_started(&self, st: &mut BridgeState, params: &Value) {
        let turn: TurnInfo = params
            .get("turn")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();
        if !turn.id.is_empty() {
            st.session.turn_id = Some(turn.id.clone());
        }
        st.turn_active = true;
        st.turn_started_at = Some(Instant::now());

        let mode = params
            .get("collaborationMode")
            .or_else(|| params.get("turn").and_then(|t| t.get("collaborationMode")))
            .and_then(|m| m.as_str().or_else(|| m.get("mode").and_then(|v| v.as_str())))
            .and_then(CollaborationMode::parse);
        if let Some(mode) = mode
            && mode != st.session.collaboration_mode
        {
            st.session.collaboration_mode = mode;
            st.permission_mode = mode.permission_mode();
            self.emit_update(SessionUpdate {
                permission_mode: Some(st.permission_mode),
                ..Default::default()
            });
        }

        self.emit(CanonicalMessage::status(SessionStatus::Running));

        if st.interrupt_requested {
            self.send_interrupt(st);
        }
    }

    fn turn_completed(&self, st: &mut BridgeState, params: &Value) {
        let turn: TurnInfo = params
            .get("turn")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();

        st.num_turns += 1;
        let duration_ms = st
            .turn_started_at
            .take()
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let usage = st.account.usage.map(|u| u.last);

        self.emit(translator::turn_result(
            &self.config.session_id,
            &turn,
            duration_ms,
            st.num_turns,
            usage,
        ));
        self.emit(CanonicalMessage::status(SessionStatus::Idle));

        st.turn_active = false;
        st.interrupt_requested = false;
        st.session.turn_id = None;
        st.plan_text.clear();
    }

    fn plan_updated(&self, st: &mut BridgeState, params: &Value) {
        let steps: Vec<PlanStep> = params
            .get("plan")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();
        let todos = if steps.is_empty() {
            translator::parse_plan_markdown(&st.plan_text)
        } else {
            translator::todos_from_steps(&steps)
        };
        if todos.is_empty() {
            return;
        }

        st.plan_updates += 1;
        let turn = str_param(params, "turnId")
            .map(String::from)
            .or_else(|| st.session.turn_id.clone())
            .unwrap_or_else(|| "turn".to_string());
        let id = format!("plan_{}_{}", turn, st.plan_updates);
        let parent = st.parent_for(str_param(params, "threadId"));
        self.emit(CanonicalMessage::assistant(
            translator::message_id(&id),
            st.model.clone(),
            vec![translator::todo_write_block(&id, &todos)],
            parent,
        ));
    }

    fn token_usage(&self, st: &mut BridgeState, params: &Value) {
        let Some(usage) = params
            .get("tokenUsage")
            .and_then(|u| serde_json::from_value::<ThreadTokenUsage>(u.clone()).ok())
        else {
            return;
        };
        let snapshot = UsageSnapshot {
            last: usage.last.into(),
            total: usage.total.into(),
            context_window: usage.model_context_window,
        };
        st.account.usage = Some(snapshot);

        if let Some(percent) = translator::context_used_percent(&snapshot.last, snapshot.context_window) {
            self.emit_update(SessionUpdate {
                context_used_percent: Some(percent),
                ..Default::default()
            });
        }
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    fn on_transport_closed(&self, peer: &Arc<RpcPeer>) {
        let mut st = self.state.lock();
        if !Arc::ptr_eq(&st.peer, peer) {
            debug!("Ignoring close of superseded connection {}", peer.label());
            return;
        }

        info!("Connection {} closed", peer.label());
        st.abort_tool_timers();
        st.command_timers.clear();
        st.turn_active = false;
        if st.status != BridgeStatus::Failed {
            st.status = BridgeStatus::Disconnected;
        }
        self.signal_disconnect(&mut st, Some("The agent process exited".to_string()));
    }
}
