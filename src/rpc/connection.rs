//! Connection manager — one logical JSON-RPC connection over `tokio-tungstenite`.
//!
//! A background tokio task owns the transport and all of its timers:
//! - request/response correlation by monotonic id
//! - per-request deadlines (a late response after expiry is ignored)
//! - application-level keepalive probe with round-trip latency tracking
//! - linear-backoff reconnection bounded by attempt count
//!
//! The public handle talks to the task over an mpsc command channel, so the
//! manager is safe under any number of concurrent logical callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ConnectionError, RpcError};
use crate::rpc::{ConnectionConfig, ConnectionState, RpcRequest, RpcResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type Reply = oneshot::Sender<Result<Value, RpcError>>;
type ConnectDone = oneshot::Sender<Result<(), RpcError>>;

/// Sentinel for "no probe round trip measured yet".
const LATENCY_UNKNOWN: u64 = u64::MAX;

// ─── Commands from the public handle to the background task ─────────────────

enum Command {
    Connect(ConnectDone),
    Call {
        api: String,
        method: String,
        args: Vec<Value>,
        reply: Reply,
    },
    Close,
}

// ─── Disconnect reasons for the reconnection decision ────────────────────────

enum DisconnectReason {
    UserRequested,
    NormalClose,
    ProbeTimeout,
    Error(String),
}

// ─── Pending requests ────────────────────────────────────────────────────────

enum PendingKind {
    Caller(Reply),
    Probe,
}

struct PendingRequest {
    sent_at: Instant,
    deadline: Instant,
    kind: PendingKind,
}

/// A call issued before the first connection was established; flushed once
/// the transport comes up.
struct BufferedCall {
    api: String,
    method: String,
    args: Vec<Value>,
    reply: Reply,
}

// ─── Background task state ───────────────────────────────────────────────────

struct TaskState {
    config: ConnectionConfig,
    cmd_rx: mpsc::Receiver<Command>,
    state: Arc<AtomicU8>,
    latency_ms: Arc<AtomicU64>,
    /// Monotonic; never reused for the lifetime of this manager.
    next_request_id: u64,
    pending: HashMap<u64, PendingRequest>,
    buffered: Vec<BufferedCall>,
    reconnect_attempts: u32,
    ever_connected: bool,
}

impl TaskState {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

// ─── Public ConnectionManager ────────────────────────────────────────────────

/// Manages exactly one logical connection to one node endpoint.
pub struct ConnectionManager {
    config: ConnectionConfig,
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
    latency_ms: Arc<AtomicU64>,
    task_handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create the manager and its background task. Does not connect yet.
    pub fn new(config: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8));
        let latency_ms = Arc::new(AtomicU64::new(LATENCY_UNKNOWN));

        let task_state = TaskState {
            config: config.clone(),
            cmd_rx,
            state: Arc::clone(&state),
            latency_ms: Arc::clone(&latency_ms),
            next_request_id: 1,
            pending: HashMap::new(),
            buffered: Vec::new(),
            reconnect_attempts: 0,
            ever_connected: false,
        };
        let task_handle = tokio::spawn(run_task(task_state));

        Self {
            config,
            cmd_tx,
            state,
            latency_ms,
            task_handle,
        }
    }

    /// Connect to the endpoint.
    ///
    /// Idempotent: concurrent calls while an attempt is underway all wait on
    /// that attempt and receive its outcome; a call while connected resolves
    /// immediately. Fails with `ConnectionError::Timeout` when the transport
    /// does not signal readiness within the handshake timeout.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(done_tx))
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::NotConnected.into()),
        }
    }

    /// Perform one `api.method(args)` call over the live transport.
    ///
    /// Fails with `ConnectionError::NotConnected` when no live transport
    /// exists; only calls issued before the first connection is established
    /// are buffered and flushed on success. A response carrying an `error`
    /// member fails with `RpcError::Protocol`; no response within the request
    /// timeout fails with `ConnectionError::RequestTimeout`.
    pub async fn call(
        &self,
        api: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                api: api.to_string(),
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::Closed {
                code: None,
                reason: "connection task ended".into(),
            }
            .into()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Latest keepalive round-trip latency in milliseconds, if measured.
    pub fn observed_latency_ms(&self) -> Option<u64> {
        match self.latency_ms.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            ms => Some(ms),
        }
    }

    /// Stop keepalive and the transport unconditionally. Terminal: the
    /// manager never reconnects after this.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn run_task(mut state: TaskState) {
    'lifecycle: loop {
        // ── 1. Idle: wait for an external connect() ──────────────────────
        let mut waiters: Vec<ConnectDone> = Vec::new();
        loop {
            match state.cmd_rx.recv().await {
                Some(Command::Connect(done)) => {
                    waiters.push(done);
                    break;
                }
                Some(Command::Call {
                    api,
                    method,
                    args,
                    reply,
                }) => {
                    if state.ever_connected {
                        let _ = reply.send(Err(ConnectionError::NotConnected.into()));
                    } else {
                        state.buffered.push(BufferedCall {
                            api,
                            method,
                            args,
                            reply,
                        });
                    }
                }
                Some(Command::Close) | None => {
                    shutdown(&mut state);
                    return;
                }
            }
        }

        // ── 2. Externally driven attempt: no automatic retry on failure ──
        state.set_state(ConnectionState::Connecting);
        let mut parts = match attempt_connect(&mut state, &mut waiters).await {
            Attempt::Ready(parts) => parts,
            Attempt::Failed(err) => {
                tracing::warn!(url = %state.config.url, "connect failed: {}", err);
                state.set_state(ConnectionState::Disconnected);
                for done in waiters {
                    let _ = done.send(Err(err.clone()));
                }
                continue 'lifecycle;
            }
            Attempt::Shutdown => {
                shutdown(&mut state);
                return;
            }
        };

        // ── 3. Session loop with bounded automatic reconnection ──────────
        loop {
            state.reconnect_attempts = 0;
            state.ever_connected = true;
            state.set_state(ConnectionState::Connected);
            tracing::info!(url = %state.config.url, "connected");
            for done in waiters.drain(..) {
                let _ = done.send(Ok(()));
            }

            let (mut sink, source) = parts;
            flush_buffered(&mut state, &mut sink).await;
            let reason = run_connected(&mut state, sink, source).await;
            fail_pending(&mut state, &reason);

            match reason {
                DisconnectReason::UserRequested => {
                    state.set_state(ConnectionState::Disconnected);
                    shutdown(&mut state);
                    return;
                }
                DisconnectReason::NormalClose => {
                    tracing::info!(url = %state.config.url, "server closed the connection");
                    state.set_state(ConnectionState::Disconnected);
                    continue 'lifecycle;
                }
                DisconnectReason::ProbeTimeout | DisconnectReason::Error(_) => {}
            }

            // ── 4. Reconnect with linear backoff ─────────────────────────
            state.set_state(ConnectionState::Connecting);
            parts = loop {
                if !state.config.reconnect
                    || state
                        .config
                        .reconnect_backoff
                        .exhausted(state.reconnect_attempts)
                {
                    tracing::warn!(
                        url = %state.config.url,
                        attempts = state.reconnect_attempts,
                        "reconnect budget exhausted; staying disconnected"
                    );
                    state.set_state(ConnectionState::Disconnected);
                    for done in waiters.drain(..) {
                        let _ = done.send(Err(ConnectionError::NotConnected.into()));
                    }
                    continue 'lifecycle;
                }
                state.reconnect_attempts += 1;
                let delay = state
                    .config
                    .reconnect_backoff
                    .delay_for_attempt(state.reconnect_attempts);
                tracing::info!(
                    url = %state.config.url,
                    attempt = state.reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting"
                );
                if !sleep_serving_commands(&mut state, &mut waiters, delay).await {
                    shutdown(&mut state);
                    return;
                }
                match attempt_connect(&mut state, &mut waiters).await {
                    Attempt::Ready(parts) => break parts,
                    Attempt::Failed(err) => {
                        tracing::warn!(url = %state.config.url, "reconnect failed: {}", err);
                    }
                    Attempt::Shutdown => {
                        shutdown(&mut state);
                        return;
                    }
                }
            };
        }
    }
}

/// The inner connected loop — runs until the connection breaks.
async fn run_connected(
    state: &mut TaskState,
    mut sink: WsSink,
    mut source: WsSource,
) -> DisconnectReason {
    let mut keepalive = tokio::time::interval(state.config.keepalive_interval);
    keepalive.reset(); // skip the immediate first tick

    loop {
        let next_deadline = state.pending.values().map(|p| p.deadline).min();

        tokio::select! {
            // ── a) Incoming frame ────────────────────────────────────────
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = handle_frame(state, text.as_ref()) {
                            let _ = sink.close().await;
                            return reason;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        return if code == 1000 {
                            DisconnectReason::NormalClose
                        } else {
                            DisconnectReason::Error(format!("close code {}: {}", code, reason))
                        };
                    }
                    Some(Ok(_)) => {} // Binary, Frame — ignored
                    Some(Err(e)) => return DisconnectReason::Error(e.to_string()),
                    None => return DisconnectReason::Error("stream ended".into()),
                }
            }

            // ── b) Command from the public handle ────────────────────────
            cmd = state.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Connect(done)) => {
                        // Already connected — idempotent.
                        let _ = done.send(Ok(()));
                    }
                    Some(Command::Call { api, method, args, reply }) => {
                        if let Err(e) = send_call(
                            state,
                            &mut sink,
                            &api,
                            &method,
                            args,
                            PendingKind::Caller(reply),
                        )
                        .await
                        {
                            return DisconnectReason::Error(e);
                        }
                    }
                    Some(Command::Close) => {
                        state.set_state(ConnectionState::Closing);
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client close".into(),
                        }))).await;
                        return DisconnectReason::UserRequested;
                    }
                    None => return DisconnectReason::UserRequested,
                }
            }

            // ── c) Keepalive probe ───────────────────────────────────────
            _ = keepalive.tick() => {
                let (api, method) = state.config.probe.clone();
                if let Err(e) = send_call(
                    state,
                    &mut sink,
                    &api,
                    &method,
                    Vec::new(),
                    PendingKind::Probe,
                )
                .await
                {
                    return DisconnectReason::Error(e);
                }
            }

            // ── d) Earliest pending deadline ─────────────────────────────
            () = deadline_sleep(next_deadline) => {
                if expire_pending(state) {
                    let _ = sink.close().await;
                    return DisconnectReason::ProbeTimeout;
                }
            }
        }
    }
}

// ─── Connection establishment ────────────────────────────────────────────────

enum Attempt {
    Ready((WsSink, WsSource)),
    Failed(RpcError),
    Shutdown,
}

/// One handshake attempt, serving commands while it is in flight so that
/// concurrent `connect()` callers coalesce onto this attempt.
async fn attempt_connect(state: &mut TaskState, waiters: &mut Vec<ConnectDone>) -> Attempt {
    let url = state.config.url.clone();
    let handshake = tokio::time::timeout(state.config.handshake_timeout, connect_async(url));
    tokio::pin!(handshake);

    loop {
        tokio::select! {
            outcome = &mut handshake => {
                return match outcome {
                    Ok(Ok((stream, _response))) => Attempt::Ready(stream.split()),
                    Ok(Err(e)) => {
                        Attempt::Failed(ConnectionError::Transport(e.to_string()).into())
                    }
                    // Dropping the in-flight handshake tears down the
                    // half-open transport.
                    Err(_) => Attempt::Failed(ConnectionError::Timeout.into()),
                };
            }
            cmd = state.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Connect(done)) => waiters.push(done),
                    Some(Command::Call { api, method, args, reply }) => {
                        if state.ever_connected {
                            let _ = reply.send(Err(ConnectionError::NotConnected.into()));
                        } else {
                            state.buffered.push(BufferedCall { api, method, args, reply });
                        }
                    }
                    Some(Command::Close) | None => return Attempt::Shutdown,
                }
            }
        }
    }
}

/// Backoff sleep that keeps answering commands. Returns false on shutdown.
async fn sleep_serving_commands(
    state: &mut TaskState,
    waiters: &mut Vec<ConnectDone>,
    delay: std::time::Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = state.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Connect(done)) => waiters.push(done),
                    Some(Command::Call { reply, .. }) => {
                        let _ = reply.send(Err(ConnectionError::NotConnected.into()));
                    }
                    Some(Command::Close) | None => return false,
                }
            }
        }
    }
}

// ─── Frame handling ──────────────────────────────────────────────────────────

/// Correlate an inbound frame with its pending request. Returns a disconnect
/// reason only when a keepalive probe comes back failed.
fn handle_frame(state: &mut TaskState, text: &str) -> Option<DisconnectReason> {
    let frame: RpcResponse = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("undecodable frame: {} — raw: {}", e, text);
            return None;
        }
    };

    let Some(id) = frame.id else {
        // Broadcast notice — not correlated to any request.
        return None;
    };
    let Some(pending) = state.pending.remove(&id) else {
        // Late response after its timeout already fired.
        tracing::debug!(id, "response for unknown or expired request ignored");
        return None;
    };

    let outcome = match (frame.result, frame.error) {
        (_, Some(err)) => Err(RpcError::Protocol(err.to_message())),
        (Some(result), None) => Ok(result),
        (None, None) => Err(RpcError::Protocol(
            "response carries neither result nor error".into(),
        )),
    };

    match pending.kind {
        PendingKind::Caller(reply) => {
            let _ = reply.send(outcome);
            None
        }
        PendingKind::Probe => match outcome {
            Ok(_) => {
                let rtt = pending.sent_at.elapsed().as_millis() as u64;
                state.latency_ms.store(rtt, Ordering::Relaxed);
                tracing::debug!(rtt_ms = rtt, "keepalive probe round trip");
                None
            }
            Err(e) => Some(DisconnectReason::Error(format!(
                "keepalive probe failed: {}",
                e
            ))),
        },
    }
}

/// Frame and send one call, registering its pending entry. An `Err` means
/// the transport itself failed.
async fn send_call(
    state: &mut TaskState,
    sink: &mut WsSink,
    api: &str,
    method: &str,
    args: Vec<Value>,
    kind: PendingKind,
) -> Result<(), String> {
    let id = state.next_request_id;
    state.next_request_id += 1;

    let frame = RpcRequest::call(id, api, method, args);
    let json = match serde_json::to_string(&frame) {
        Ok(json) => json,
        Err(e) => {
            if let PendingKind::Caller(reply) = kind {
                let _ = reply.send(Err(RpcError::Protocol(format!(
                    "unserializable request: {}",
                    e
                ))));
            }
            return Ok(()); // not a transport fault
        }
    };

    let now = Instant::now();
    state.pending.insert(
        id,
        PendingRequest {
            sent_at: now,
            deadline: now + state.config.request_timeout,
            kind,
        },
    );

    if let Err(e) = sink.send(Message::Text(json.into())).await {
        if let Some(pending) = state.pending.remove(&id) {
            if let PendingKind::Caller(reply) = pending.kind {
                let _ = reply.send(Err(ConnectionError::Transport(e.to_string()).into()));
            }
        }
        return Err(e.to_string());
    }
    Ok(())
}

/// Remove pending entries past their deadline. Returns true when an expired
/// entry was a keepalive probe.
fn expire_pending(state: &mut TaskState) -> bool {
    let now = Instant::now();
    let expired: Vec<u64> = state
        .pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    let mut probe_expired = false;
    for id in expired {
        if let Some(pending) = state.pending.remove(&id) {
            match pending.kind {
                PendingKind::Caller(reply) => {
                    tracing::warn!(id, "request timed out");
                    let _ = reply.send(Err(ConnectionError::RequestTimeout.into()));
                }
                PendingKind::Probe => {
                    tracing::warn!(id, "keepalive probe timed out");
                    probe_expired = true;
                }
            }
        }
    }
    probe_expired
}

// ─── Teardown helpers ────────────────────────────────────────────────────────

/// Flush calls buffered before the first connection came up.
async fn flush_buffered(state: &mut TaskState, sink: &mut WsSink) {
    if state.buffered.is_empty() {
        return;
    }
    tracing::info!(
        count = state.buffered.len(),
        "flushing buffered pre-connection calls"
    );
    let buffered = std::mem::take(&mut state.buffered);
    for call in buffered {
        if let Err(e) = send_call(
            state,
            sink,
            &call.api,
            &call.method,
            call.args,
            PendingKind::Caller(call.reply),
        )
        .await
        {
            tracing::warn!("failed to flush buffered call: {}", e);
        }
    }
}

/// Fail every in-flight request when the session ends.
fn fail_pending(state: &mut TaskState, reason: &DisconnectReason) {
    let error = match reason {
        DisconnectReason::UserRequested | DisconnectReason::NormalClose => {
            ConnectionError::Closed {
                code: Some(1000),
                reason: "connection closed".into(),
            }
        }
        DisconnectReason::ProbeTimeout => ConnectionError::Closed {
            code: None,
            reason: "keepalive probe timed out".into(),
        },
        DisconnectReason::Error(msg) => ConnectionError::Closed {
            code: None,
            reason: msg.clone(),
        },
    };
    for (_, pending) in state.pending.drain() {
        if let PendingKind::Caller(reply) = pending.kind {
            let _ = reply.send(Err(error.clone().into()));
        }
    }
}

fn shutdown(state: &mut TaskState) {
    state.set_state(ConnectionState::Disconnected);
    for call in state.buffered.drain(..) {
        let _ = call.reply.send(Err(ConnectionError::NotConnected.into()));
    }
}

/// Sleep until the given deadline, or forever when there is none.
async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "no close frame".into()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
