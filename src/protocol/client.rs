//! Gateway protocol client
//!
//! `GatewayClient` owns one transport at a time and keeps a logical session
//! alive against the Gateway:
//!
//! 1. On transport open it sends a versioned connect request announcing a
//!    `client.mode` taken from an ordered candidate list.
//! 2. A rejection naming the mode field advances to the next candidate and
//!    forces a full reconnect. The candidate index survives reconnects.
//! 3. The session becomes ready on an acknowledgement tied to the connect
//!    request id, on a `hello-ok` event, or (simulated transport only) when a
//!    bounded fallback timer elapses without an explicit ack.
//! 4. Once ready, latency probes start and the reconnect counter resets.
//!
//! Transport closes feed an exponential backoff loop unless reconnection was
//! disabled by [`GatewayClient::disconnect`].
//!
//! All session state sits behind one synchronous mutex that is never held
//! across an await point; timers and the event pump are spawned tasks tagged
//! with a connection generation so late events from a torn-down transport
//! are ignored.

use super::backoff::ReconnectPolicy;
use super::envelope::{ConnectParams, Dialect, Envelope, InboundMessage};
use super::simulated::SimulatedTransportFactory;
use super::transport::{
    close_code, Transport, TransportEvent, TransportFactory, TransportFault, TransportKind,
};
use super::websocket::WebSocketTransportFactory;
use crate::error::{Error, Result};
use crate::sentinel::GatewaySnapshot;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Client modes tried in order during the handshake
pub const DEFAULT_CLIENT_MODES: &[&str] = &["cli", "operator", "dashboard", "command_center", "agent"];

/// Matches handshake errors caused by the `client.mode` field
const MODE_REJECTION_PATTERN: &str =
    r"(?i)(client[./]mode|invalid\s+mode|unsupported\s+mode|unknown\s+mode)";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub token: Option<String>,
    /// Offline operation against the simulated peer, legacy dialect
    pub safe_mode: bool,
    pub client_modes: Vec<String>,
    pub request_timeout: Duration,
    pub latency_probe_interval: Duration,
    /// Simulated transport only
    pub handshake_fallback: Duration,
    pub reconnect: ReconnectPolicy,
    /// Pause between closing and reopening on a forced reconnect
    pub settle_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            safe_mode: false,
            client_modes: DEFAULT_CLIENT_MODES.iter().map(|m| m.to_string()).collect(),
            request_timeout: Duration::from_secs(30),
            latency_probe_interval: Duration::from_secs(15),
            handshake_fallback: Duration::from_millis(1500),
            reconnect: ReconnectPolicy::default(),
            settle_delay: Duration::from_millis(250),
        }
    }
}

/// Runtime endpoint change
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigUpdate {
    pub url: Option<String>,
    pub token: Option<String>,
    /// `Some(false)` applies the change without reconnecting
    pub reconnect: Option<bool>,
}

/// Read-only view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// True only once the handshake has been acknowledged
    pub connected: bool,
    pub latency: Option<u64>,
    pub reconnect_attempts: u32,
    pub safe_mode: bool,
    pub gateway_url: String,
    pub client_mode: String,
    pub last_error: Option<String>,
}

impl From<&ConnectionStatus> for GatewaySnapshot {
    fn from(status: &ConnectionStatus) -> Self {
        Self {
            connected: status.connected,
            latency_ms: status.latency,
            reconnect_attempts: status.reconnect_attempts,
        }
    }
}

/// Notifications published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { mode: String },
    Disconnected { code: u16, reason: String },
    Thought(Value),
    BrowserEvent(Value),
    ChatMessage(Value),
    HistoryBatch(Value),
}

type Resolver = oneshot::Sender<std::result::Result<Value, String>>;

#[derive(Default)]
struct Timers {
    handshake: Option<JoinHandle<()>>,
    latency: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_session(&mut self) {
        for handle in [self.handshake.take(), self.latency.take(), self.pump.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_session();
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct SessionState {
    url: String,
    token: Option<String>,
    session_ready: bool,
    reconnect_attempts: u32,
    latency_ms: Option<u64>,
    pending_connect_id: Option<String>,
    client_mode_index: usize,
    modes_exhausted: bool,
    last_error: Option<String>,
    reconnect_allowed: bool,
    started: bool,
    generation: u64,
    outstanding_ping: Option<(String, Instant)>,
    transport: Option<Box<dyn Transport>>,
    pending: HashMap<String, Resolver>,
    timers: Timers,
}

struct ClientInner {
    factory: Arc<dyn TransportFactory>,
    options: ClientOptions,
    dialect: Dialect,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
}

/// Resilient Gateway session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    /// Create a client with an injected transport factory
    pub fn new(options: ClientOptions, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = SessionState {
            url: options.url.trim().to_string(),
            token: options.token.clone(),
            session_ready: false,
            reconnect_attempts: 0,
            latency_ms: None,
            pending_connect_id: None,
            client_mode_index: 0,
            modes_exhausted: false,
            last_error: None,
            reconnect_allowed: true,
            started: false,
            generation: 0,
            outstanding_ping: None,
            transport: None,
            pending: HashMap::new(),
            timers: Timers::default(),
        };
        Self {
            inner: Arc::new(ClientInner {
                factory,
                dialect: Dialect::for_safe_mode(options.safe_mode),
                options,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    /// Simulated peer in safe mode, WebSocket otherwise
    pub fn with_default_transport(options: ClientOptions) -> Self {
        let factory: Arc<dyn TransportFactory> = if options.safe_mode {
            Arc::new(SimulatedTransportFactory::default())
        } else {
            Arc::new(WebSocketTransportFactory)
        };
        Self::new(options, factory)
    }

    /// Open a new transport, discarding any lingering session first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut state = self.inner.lock();
        state.started = true;
        state.reconnect_allowed = true;
        self.inner.open_session(&mut state);
    }

    /// Close the session without scheduling a reconnect
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.started = false;
        state.reconnect_allowed = false;
        self.inner.teardown(&mut state, "client disconnect");
        // Dropping the resolvers fails in-flight calls with `Cancelled`
        state.pending.clear();
        tracing::info!(url = %state.url, "Gateway client disconnected");
    }

    /// Write an envelope if the transport is open; returns whether it was written
    pub fn send(&self, envelope: &Envelope) -> bool {
        let state = self.inner.lock();
        self.inner.send_locked(&state, envelope)
    }

    /// Invoke a Gateway tool and wait for its correlated result
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.lock();
            if !state.session_ready {
                return Err(Error::SessionNotReady);
            }
            state.pending.insert(id.clone(), tx);
            let envelope = self.inner.dialect.tool_call(&id, name, args);
            self.inner.send_locked(&state, &envelope);
        }

        tracing::debug!(request_id = %id, tool = name, "Tool call sent");

        match tokio::time::timeout(self.inner.options.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::ToolCall(message)),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.inner.lock().pending.remove(&id);
                tracing::warn!(request_id = %id, tool = name, "Tool call timed out");
                Err(Error::RequestTimeout)
            }
        }
    }

    pub fn send_chat_message(&self, text: &str) -> bool {
        let id = uuid::Uuid::new_v4().to_string();
        self.send(&self.inner.dialect.chat_message(&id, text))
    }

    pub fn request_history(&self, limit: usize) -> bool {
        let id = uuid::Uuid::new_v4().to_string();
        self.send(&self.inner.dialect.request_history(&id, limit))
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.inner.lock();
        ConnectionStatus {
            connected: state.session_ready,
            latency: state.latency_ms,
            reconnect_attempts: state.reconnect_attempts,
            safe_mode: self.inner.options.safe_mode,
            gateway_url: state.url.clone(),
            client_mode: self.inner.current_mode(&state),
            last_error: state.last_error.clone(),
        }
    }

    /// Connection signals consumed by the reliability engine
    pub fn gateway_snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot::from(&self.connection_status())
    }

    /// Change endpoint or token at runtime.
    ///
    /// Returns whether a reconnect was forced. An invalid endpoint is rejected
    /// without touching the current settings.
    pub fn update_runtime_config(&self, update: RuntimeConfigUpdate) -> Result<bool> {
        if let Some(ref url) = update.url {
            validate_endpoint(url)?;
        }

        let mut state = self.inner.lock();
        let mut changed = false;
        if let Some(url) = update.url.as_deref().map(str::trim) {
            if url != state.url {
                state.url = url.to_string();
                // A new gateway starts over at the first candidate
                state.client_mode_index = 0;
                state.modes_exhausted = false;
                changed = true;
            }
        }
        if let Some(token) = update.token {
            let token = Some(token).filter(|t| !t.is_empty());
            if token != state.token {
                state.token = token;
                changed = true;
            }
        }

        if !changed || !state.started || update.reconnect == Some(false) {
            return Ok(false);
        }

        tracing::info!(url = %state.url, "Gateway target changed, reconnecting");
        self.inner.force_reconnect(&mut state, "runtime config changed");
        Ok(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.factory.kind()
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn current_mode(&self, state: &SessionState) -> String {
        let modes = &self.options.client_modes;
        modes
            .get(state.client_mode_index)
            .or_else(|| modes.last())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLIENT_MODES[0].to_string())
    }

    /// Abort session timers, close the transport and invalidate its events
    fn teardown(&self, state: &mut SessionState, reason: &str) {
        state.generation += 1;
        state.timers.abort_all();
        if let Some(transport) = state.transport.take() {
            transport.close();
        }
        state.pending_connect_id = None;
        state.outstanding_ping = None;
        state.latency_ms = None;
        if state.session_ready {
            state.session_ready = false;
            self.emit(ClientEvent::Disconnected {
                code: close_code::NORMAL,
                reason: reason.to_string(),
            });
        }
    }

    fn open_session(self: &Arc<Self>, state: &mut SessionState) {
        self.teardown(state, "reconnecting");
        let generation = state.generation;

        let (tx, rx) = mpsc::unbounded_channel();
        tracing::info!(
            url = %state.url,
            kind = ?self.factory.kind(),
            generation,
            "Opening gateway transport"
        );
        state.transport = Some(self.factory.open(&state.url, tx));

        let inner = self.clone();
        state.timers.pump = Some(tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                inner.handle_event(generation, event);
            }
        }));
    }

    /// Briefly disable reconnection, close, then reopen after the settle delay
    fn force_reconnect(self: &Arc<Self>, state: &mut SessionState, reason: &str) {
        state.reconnect_allowed = false;
        self.teardown(state, reason);

        let inner = self.clone();
        let settle = self.options.settle_delay;
        state.timers.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let mut state = inner.lock();
            state.timers.reconnect.take();
            if !state.started {
                return;
            }
            state.reconnect_allowed = true;
            inner.open_session(&mut state);
        }));
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        let delay = self.options.reconnect.delay(state.reconnect_attempts);
        state.reconnect_attempts += 1;
        tracing::info!(
            attempt = state.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling gateway reconnect"
        );

        let inner = self.clone();
        let generation = state.generation;
        state.timers.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.lock();
            state.timers.reconnect.take();
            if state.generation != generation || !state.reconnect_allowed {
                return;
            }
            inner.open_session(&mut state);
        }));
    }

    fn send_locked(&self, state: &SessionState, envelope: &Envelope) -> bool {
        let Some(transport) = state.transport.as_ref().filter(|t| t.is_open()) else {
            tracing::warn!(kind = %envelope.kind, "Transport not open, message dropped");
            return false;
        };
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, "Refusing to send invalid envelope: {}", e);
                return false;
            }
        };
        match transport.send(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, "Failed to send message: {}", e);
                false
            }
        }
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(&mut state),
            TransportEvent::Message(text) => match InboundMessage::parse(&text) {
                Ok(message) => self.on_message(&mut state, message),
                Err(e) => tracing::debug!("Ignoring malformed gateway frame: {}", e),
            },
            TransportEvent::Error { fault, message } => {
                tracing::warn!(fault = fault.as_str(), "Gateway transport error: {}", message);
                state.last_error = Some(format!("{}: {}", fault, message));
            }
            TransportEvent::Closed { code, reason } => self.on_closed(&mut state, code, reason),
        }
    }

    fn on_open(self: &Arc<Self>, state: &mut SessionState) {
        let id = uuid::Uuid::new_v4().to_string();
        let mode = self.current_mode(state);
        let params = ConnectParams::new(mode.clone(), state.token.as_deref());

        let envelope = match self.dialect.connect(&id, &params) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("Failed to build connect request: {}", e);
                return;
            }
        };

        tracing::debug!(request_id = %id, mode = %mode, "Sending connect request");
        state.pending_connect_id = Some(id);
        self.send_locked(state, &envelope);

        if self.factory.kind() == TransportKind::Simulated {
            let inner = self.clone();
            let generation = state.generation;
            let fallback = self.options.handshake_fallback;
            state.timers.handshake = Some(tokio::spawn(async move {
                tokio::time::sleep(fallback).await;
                let mut state = inner.lock();
                if state.generation != generation || state.pending_connect_id.is_none() {
                    return;
                }
                tracing::debug!("No handshake ack from simulated peer, assuming ready");
                inner.mark_ready(&mut state);
            }));
        }
    }

    fn on_message(self: &Arc<Self>, state: &mut SessionState, message: InboundMessage) {
        match message {
            InboundMessage::ConnectAck { id, ok, error } => {
                let matches = match (&id, &state.pending_connect_id) {
                    (Some(id), Some(pending)) => id == pending,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if matches {
                    self.on_handshake_reply(state, ok, error);
                }
            }
            InboundMessage::HelloOk => {
                if state.transport.is_some() && state.pending_connect_id.is_some() {
                    self.mark_ready(state);
                }
            }
            InboundMessage::Response {
                id,
                ok,
                payload,
                error,
            } => {
                if state.pending_connect_id.as_deref() == Some(id.as_str()) {
                    self.on_handshake_reply(state, ok, error);
                } else if self.is_probe_reply(state, &id) {
                    self.record_latency(state);
                } else if ok {
                    resolve(state, &id, Ok(payload.unwrap_or(Value::Null)));
                } else {
                    resolve(state, &id, Err(error.unwrap_or_else(|| "Request failed".to_string())));
                }
            }
            InboundMessage::ToolResult { id, result, error } => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                resolve(state, &id, outcome);
            }
            InboundMessage::Ping { id } => {
                let pong = self.dialect.pong(id);
                self.send_locked(state, &pong);
            }
            InboundMessage::Pong { id } => {
                if id.map_or(true, |id| self.is_probe_reply(state, &id)) {
                    self.record_latency(state);
                }
            }
            InboundMessage::ChatMessage(body) => self.emit(ClientEvent::ChatMessage(body)),
            InboundMessage::HistoryBatch(body) => self.emit(ClientEvent::HistoryBatch(body)),
            InboundMessage::Thought(body) => self.emit(ClientEvent::Thought(body)),
            InboundMessage::BrowserEvent(body) => self.emit(ClientEvent::BrowserEvent(body)),
            InboundMessage::Unknown { kind } => {
                tracing::debug!(kind = %kind, "Unhandled gateway message");
            }
        }
    }

    fn on_handshake_reply(self: &Arc<Self>, state: &mut SessionState, ok: bool, error: Option<String>) {
        if ok {
            self.mark_ready(state);
            return;
        }

        state.pending_connect_id = None;
        if let Some(handle) = state.timers.handshake.take() {
            handle.abort();
        }
        let error = error.unwrap_or_else(|| "connect rejected".to_string());

        if !is_mode_rejection(&error) {
            tracing::warn!(fault = TransportFault::HandshakeFailure.as_str(), "Handshake rejected: {}", error);
            state.last_error = Some(Error::Handshake(error).to_string());
            if let Some(transport) = state.transport.as_ref() {
                transport.close();
            }
            return;
        }

        let rejected = self.current_mode(state);
        if state.client_mode_index + 1 < self.options.client_modes.len() {
            state.client_mode_index += 1;
            let next = self.current_mode(state);
            tracing::warn!(
                rejected = %rejected,
                next = %next,
                index = state.client_mode_index,
                "Gateway rejected client mode, trying next candidate"
            );
            self.force_reconnect(state, "client mode rejected");
            return;
        }

        if !state.modes_exhausted {
            state.modes_exhausted = true;
            tracing::error!(
                rejected = %rejected,
                "Gateway rejected every client mode candidate: {}",
                error
            );
        }
        state.last_error = Some(Error::Handshake(error).to_string());
        // Backoff still applies
        if let Some(transport) = state.transport.as_ref() {
            transport.close();
        }
    }

    fn mark_ready(self: &Arc<Self>, state: &mut SessionState) {
        if state.session_ready {
            return;
        }
        state.session_ready = true;
        state.pending_connect_id = None;
        state.reconnect_attempts = 0;
        state.last_error = None;
        if let Some(handle) = state.timers.handshake.take() {
            handle.abort();
        }

        let inner = self.clone();
        let generation = state.generation;
        let period = self.options.latency_probe_interval;
        state.timers.latency = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let mut state = inner.lock();
                if state.generation != generation || !state.session_ready {
                    return;
                }
                let id = uuid::Uuid::new_v4().to_string();
                let probe = inner.dialect.ping(&id);
                if inner.send_locked(&state, &probe) {
                    state.outstanding_ping = Some((id, Instant::now()));
                }
            }
        }));

        let mode = self.current_mode(state);
        tracing::info!(url = %state.url, mode = %mode, "Gateway session ready");
        self.emit(ClientEvent::Connected { mode });
    }

    fn is_probe_reply(&self, state: &SessionState, id: &str) -> bool {
        state
            .outstanding_ping
            .as_ref()
            .map_or(false, |(pending, _)| pending == id)
    }

    fn record_latency(&self, state: &mut SessionState) {
        if let Some((_, sent_at)) = state.outstanding_ping.take() {
            let latency = sent_at.elapsed().as_millis() as u64;
            tracing::trace!(latency_ms = latency, "Gateway latency probe");
            state.latency_ms = Some(latency);
        }
    }

    fn on_closed(self: &Arc<Self>, state: &mut SessionState, code: u16, reason: String) {
        let fault = TransportFault::from_close_code(code);
        tracing::warn!(code, fault = fault.as_str(), reason = %reason, "Gateway transport closed");

        state.session_ready = false;
        state.pending_connect_id = None;
        state.outstanding_ping = None;
        state.latency_ms = None;
        state.transport = None;
        for handle in [state.timers.handshake.take(), state.timers.latency.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        self.emit(ClientEvent::Disconnected { code, reason });

        if state.reconnect_allowed && state.started {
            self.schedule_reconnect(state);
        }
    }
}

/// Fire the resolver for `id` at most once
fn resolve(state: &mut SessionState, id: &str, outcome: std::result::Result<Value, String>) {
    match state.pending.remove(id) {
        Some(resolver) => {
            let _ = resolver.send(outcome);
        }
        None => tracing::debug!(request_id = id, "Response for unknown or expired request"),
    }
}

fn is_mode_rejection(message: &str) -> bool {
    regex::Regex::new(MODE_REJECTION_PATTERN)
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}

/// Accept only `ws://` or `wss://` URLs with a host
pub fn validate_endpoint(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", raw, e)))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::InvalidEndpoint(format!(
            "{}: scheme must be ws or wss",
            raw
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidEndpoint(format!("{}: missing host", raw)));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::simulated::SimulatedPeerOptions;
    use serde_json::json;

    fn client_with(
        options: ClientOptions,
        peer: SimulatedPeerOptions,
    ) -> (GatewayClient, SimulatedTransportFactory) {
        let factory = SimulatedTransportFactory::new(peer);
        let client = GatewayClient::new(options, Arc::new(factory.clone()));
        (client, factory)
    }

    fn safe_options() -> ClientOptions {
        ClientOptions {
            safe_mode: true,
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn connected_count(events: &[ClientEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ClientEvent::Connected { .. }))
            .count()
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_ready_on_explicit_ack() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        let mut events = client.subscribe();

        assert!(!client.connection_status().connected);
        client.connect();
        settle(50).await;

        let status = client.connection_status();
        assert!(status.connected);
        assert!(status.safe_mode);
        assert_eq!(status.client_mode, "cli");
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(peer.log().count_kind("connect"), 1);
        assert_eq!(
            drain(&mut events),
            vec![ClientEvent::Connected {
                mode: "cli".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_socket_is_not_connected_without_ack() {
        let (client, _peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                ack_handshake: false,
                ..Default::default()
            },
        );
        client.connect();
        settle(500).await;
        assert!(!client.connection_status().connected);

        settle(1500).await;
        assert!(client.connection_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connect_yields_single_handshake() {
        let (client, peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                ack_handshake: false,
                ..Default::default()
            },
        );
        let mut events = client.subscribe();

        client.connect();
        client.connect();
        client.connect();
        settle(5_000).await;

        assert!(client.connection_status().connected);
        assert_eq!(connected_count(&drain(&mut events)), 1);
        let log = peer.log();
        assert_eq!(log.opened, 3);
        assert_eq!(log.connect_modes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_call_round_trip_both_dialects() {
        for safe_mode in [true, false] {
            let options = ClientOptions {
                safe_mode,
                ..Default::default()
            };
            let (client, peer) = client_with(options, SimulatedPeerOptions::default());
            client.connect();
            settle(50).await;

            let value = client.call_tool("search", json!({"q": "rust"})).await.unwrap();
            assert_eq!(value["tool"], "search");
            assert_eq!(value["args"]["q"], "rust");

            let log = peer.log();
            if safe_mode {
                assert_eq!(log.count_kind("tool_call"), 1);
            } else {
                assert_eq!(log.count_method("tool.call"), 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_call_explicit_error() {
        let (client, _peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                failing_tools: vec!["explode".to_string()],
                ..Default::default()
            },
        );
        client.connect();
        settle(50).await;

        let err = client.call_tool("explode", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolCall(ref m) if m == "Tool explode failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_call_times_out_after_thirty_seconds() {
        let (client, _peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                answer_tools: false,
                ..Default::default()
            },
        );
        client.connect();
        settle(50).await;

        let started = Instant::now();
        let err = client.call_tool("x", json!({})).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::RequestTimeout));
        assert_eq!(err.to_string(), "Request timeout");
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
        assert!(client.inner.lock().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_call_before_ready_fails_fast() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        let err = client.call_tool("x", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotReady));
        assert_eq!(peer.log().received.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_resolves_once() {
        let (client, peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                answer_tools: false,
                ..Default::default()
            },
        );
        client.connect();
        settle(50).await;

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call_tool("slow", json!({})).await });
        settle(10).await;

        let id = peer
            .log()
            .received
            .iter()
            .find(|e| e.kind == "tool_call")
            .and_then(|e| e.id.clone())
            .unwrap();
        let reply = Envelope::new("tool_result")
            .with_id(id.clone())
            .with_payload(json!({"n": 1}));
        peer.push(&reply).unwrap();
        peer.push(&reply).unwrap();

        let value = call.await.unwrap().unwrap();
        assert_eq!(value["n"], 1);
        settle(10).await;
        assert!(client.inner.lock().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_fallback_keeps_index() {
        let (client, peer) = client_with(
            ClientOptions::default(),
            SimulatedPeerOptions {
                rejected_modes: vec![
                    "cli".to_string(),
                    "operator".to_string(),
                    "dashboard".to_string(),
                ],
                ..Default::default()
            },
        );
        client.connect();
        settle(2_000).await;

        let status = client.connection_status();
        assert!(status.connected);
        assert_eq!(status.client_mode, "command_center");
        assert_eq!(
            peer.log().connect_modes,
            vec!["cli", "operator", "dashboard", "command_center"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_candidates_exhausted_surface_error_and_backoff() {
        let (client, peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                rejected_modes: DEFAULT_CLIENT_MODES.iter().map(|m| m.to_string()).collect(),
                ..Default::default()
            },
        );
        client.connect();
        settle(2_000).await;

        let status = client.connection_status();
        assert!(!status.connected);
        assert_eq!(status.client_mode, "agent");
        assert!(status.last_error.unwrap().contains("client.mode"));

        settle(10_000).await;
        let modes = peer.log().connect_modes;
        assert_eq!(&modes[..5], DEFAULT_CLIENT_MODES);
        assert!(modes.len() > 5);
        assert!(modes[5..].iter().all(|m| m == "agent"));
        assert!(client.connection_status().reconnect_attempts >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_then_resets_on_ready() {
        let (client, peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                refuse_connections: true,
                ..Default::default()
            },
        );
        client.connect();

        settle(500).await;
        assert_eq!(client.connection_status().reconnect_attempts, 1);
        assert!(client.connection_status().last_error.unwrap().starts_with("refused"));
        settle(1_000).await;
        assert_eq!(client.connection_status().reconnect_attempts, 2);
        settle(2_000).await;
        assert_eq!(client.connection_status().reconnect_attempts, 3);
        assert_eq!(peer.log().opened, 3);

        peer.update_options(|o| o.refuse_connections = false);
        settle(4_000).await;

        let status = client.connection_status();
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        let mut events = client.subscribe();
        client.connect();
        settle(50).await;

        peer.drop_connection(close_code::POLICY_VIOLATION, "policy");
        settle(10).await;
        assert!(!client.connection_status().connected);
        assert_eq!(client.connection_status().reconnect_attempts, 1);

        settle(1_100).await;
        assert!(client.connection_status().connected);
        let events = drain(&mut events);
        assert_eq!(connected_count(&events), 2);
        assert!(events.contains(&ClientEvent::Disconnected {
            code: close_code::POLICY_VIOLATION,
            reason: "policy".to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnecting() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;

        client.disconnect();
        settle(60_000).await;

        assert!(!client.connection_status().connected);
        assert_eq!(peer.log().opened, 1);
        assert!(!client.send_chat_message("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_probe_and_peer_ping() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;

        assert!(client.connection_status().latency.is_some());
        assert_eq!(client.gateway_snapshot().latency_ms, client.connection_status().latency);

        peer.push(&Envelope::new("ping").with_id("srv-1")).unwrap();
        settle(10).await;
        assert!(peer
            .log()
            .received
            .iter()
            .any(|e| e.kind == "pong" && e.id.as_deref() == Some("srv-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_forwarded() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        let mut events = client.subscribe();
        client.connect();
        settle(50).await;
        drain(&mut events);

        peer.push(&Envelope::new("thought").with_payload(json!({"text": "hmm"})))
            .unwrap();
        assert!(client.send_chat_message("hi"));
        assert!(client.request_history(20));
        settle(50).await;

        let events = drain(&mut events);
        assert!(events.contains(&ClientEvent::Thought(json!({"text": "hmm"}))));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::ChatMessage(v) if v["text"] == "(simulated) hi")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::HistoryBatch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_noop_when_closed() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        assert!(!client.send(&Envelope::new("chat_message")));
        assert!(peer.log().received.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_config_rejects_invalid_endpoint() {
        let (client, _peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        let before = client.connection_status().gateway_url;

        for bad in ["not a url", "http://example.com", "ws://"] {
            let err = client
                .update_runtime_config(RuntimeConfigUpdate {
                    url: Some(bad.to_string()),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, Error::InvalidEndpoint(_)), "{}", bad);
        }
        assert_eq!(client.connection_status().gateway_url, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_config_change_forces_reconnect() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;

        let forced = client
            .update_runtime_config(RuntimeConfigUpdate {
                url: Some("wss://gateway.example.com/ws".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(forced);
        assert!(!client.connection_status().connected);

        settle(500).await;
        let status = client.connection_status();
        assert!(status.connected);
        assert_eq!(status.gateway_url, "wss://gateway.example.com/ws");
        assert_eq!(peer.log().opened, 2);

        let forced = client
            .update_runtime_config(RuntimeConfigUpdate {
                token: Some("t2".to_string()),
                reconnect: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(!forced);
        assert!(client.connection_status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_config_same_target_is_noop() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;

        let url = client.connection_status().gateway_url;
        let forced = client
            .update_runtime_config(RuntimeConfigUpdate {
                url: Some(url),
                ..Default::default()
            })
            .unwrap();
        assert!(!forced);
        assert_eq!(peer.log().opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_config_stores_trimmed_endpoint() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;

        let forced = client
            .update_runtime_config(RuntimeConfigUpdate {
                url: Some("  ws://gw.example.com:18789  ".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(forced);
        assert_eq!(client.connection_status().gateway_url, "ws://gw.example.com:18789");
        validate_endpoint(&client.connection_status().gateway_url).unwrap();

        settle(500).await;
        let forced = client
            .update_runtime_config(RuntimeConfigUpdate {
                url: Some("ws://gw.example.com:18789 ".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(!forced);
        assert_eq!(peer.log().opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_target_restarts_mode_candidates() {
        let (client, peer) = client_with(
            safe_options(),
            SimulatedPeerOptions {
                rejected_modes: vec!["cli".to_string(), "operator".to_string()],
                ..Default::default()
            },
        );
        client.connect();
        settle(1_000).await;
        assert_eq!(client.connection_status().client_mode, "dashboard");

        peer.update_options(|o| o.rejected_modes.clear());
        client
            .update_runtime_config(RuntimeConfigUpdate {
                url: Some("ws://other.example.com:18789".to_string()),
                ..Default::default()
            })
            .unwrap();
        settle(500).await;

        let status = client.connection_status();
        assert!(status.connected);
        assert_eq!(status.client_mode, "cli");
        assert_eq!(peer.log().connect_modes.last().map(String::as_str), Some("cli"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_and_disconnect_clear_latency() {
        let (client, peer) = client_with(safe_options(), SimulatedPeerOptions::default());
        client.connect();
        settle(50).await;
        assert!(client.connection_status().latency.is_some());

        peer.drop_connection(close_code::ABNORMAL, "gone");
        settle(10).await;
        assert!(client.connection_status().latency.is_none());
        assert!(client.gateway_snapshot().latency_ms.is_none());

        settle(1_100).await;
        assert!(client.connection_status().latency.is_some());
        client.disconnect();
        assert!(client.connection_status().latency.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_ok_after_rejection_is_ignored() {
        let options = ClientOptions {
            safe_mode: true,
            handshake_fallback: Duration::from_secs(60),
            ..Default::default()
        };
        let (client, peer) = client_with(
            options,
            SimulatedPeerOptions {
                ack_handshake: false,
                ..Default::default()
            },
        );
        let mut events = client.subscribe();
        client.connect();
        settle(50).await;

        let rejection = Envelope {
            kind: "connect_ack".to_string(),
            ok: Some(false),
            error: Some(Value::String("invalid token".to_string())),
            ..Default::default()
        };
        peer.push(&rejection).unwrap();
        peer.push(&Envelope::new("hello-ok")).unwrap();
        settle(10).await;

        assert_eq!(connected_count(&drain(&mut events)), 0);
        assert!(!client.connection_status().connected);
        assert!(client
            .connection_status()
            .last_error
            .unwrap()
            .contains("invalid token"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_ok_with_pending_connect_marks_ready() {
        let options = ClientOptions {
            safe_mode: true,
            handshake_fallback: Duration::from_secs(60),
            ..Default::default()
        };
        let (client, peer) = client_with(
            options,
            SimulatedPeerOptions {
                ack_handshake: false,
                ..Default::default()
            },
        );
        client.connect();
        settle(50).await;
        assert!(!client.connection_status().connected);

        peer.push(&Envelope::new("hello-ok")).unwrap();
        settle(10).await;
        assert!(client.connection_status().connected);
    }

    #[test]
    fn test_mode_rejection_matching() {
        assert!(is_mode_rejection("invalid connect params: at /client/mode"));
        assert!(is_mode_rejection("unsupported client.mode \"cli\""));
        assert!(is_mode_rejection("Unknown mode"));
        assert!(!is_mode_rejection("invalid token"));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ConnectionStatus {
            connected: true,
            latency: Some(12),
            reconnect_attempts: 0,
            safe_mode: false,
            gateway_url: "ws://127.0.0.1:18789".to_string(),
            client_mode: "cli".to_string(),
            last_error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["reconnectAttempts"], 0);
        assert_eq!(json["gatewayUrl"], "ws://127.0.0.1:18789");
        assert_eq!(json["safeMode"], false);
    }
}
