//! In-process simulated gateway peer
//!
//! Backs safe mode (offline operation) and doubles as a scriptable
//! counterpart in tests. The peer understands both dialects and answers in
//! the dialect of the request it received.

use super::envelope::Envelope;
use super::transport::{
    close_code, Transport, TransportEvent, TransportEvents, TransportFactory, TransportFault,
    TransportKind,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Behaviour of the simulated peer
#[derive(Debug, Clone)]
pub struct SimulatedPeerOptions {
    /// Explicitly acknowledge connect requests
    pub ack_handshake: bool,
    /// Client modes rejected during the handshake
    pub rejected_modes: Vec<String>,
    /// Answer tool calls
    pub answer_tools: bool,
    /// Tools that answer with an error
    pub failing_tools: Vec<String>,
    /// Answer latency probes
    pub answer_pings: bool,
    /// Refuse every connection attempt
    pub refuse_connections: bool,
    /// Delay before `Open` is raised
    pub open_delay: Duration,
    /// Delay before each reply
    pub reply_delay: Duration,
}

impl Default for SimulatedPeerOptions {
    fn default() -> Self {
        Self {
            ack_handshake: true,
            rejected_modes: Vec::new(),
            answer_tools: true,
            failing_tools: Vec::new(),
            answer_pings: true,
            refuse_connections: false,
            open_delay: Duration::from_millis(5),
            reply_delay: Duration::from_millis(5),
        }
    }
}

/// What the peer has observed so far
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    /// Connection attempts
    pub opened: usize,
    /// `client.mode` of every connect request, in arrival order
    pub connect_modes: Vec<String>,
    /// Every envelope received
    pub received: Vec<Envelope>,
}

impl PeerLog {
    pub fn count_kind(&self, kind: &str) -> usize {
        self.received.iter().filter(|e| e.kind == kind).count()
    }

    pub fn count_method(&self, method: &str) -> usize {
        self.received
            .iter()
            .filter(|e| e.method.as_deref() == Some(method))
            .count()
    }
}

struct PeerConnection {
    events: TransportEvents,
    open: AtomicBool,
    closed: AtomicBool,
}

impl PeerConnection {
    /// Raise `Closed` once
    fn shut(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

#[derive(Default)]
struct PeerShared {
    log: Mutex<PeerLog>,
    current: Mutex<Option<Arc<PeerConnection>>>,
}

/// Factory for simulated transports sharing one scripted peer
#[derive(Clone, Default)]
pub struct SimulatedTransportFactory {
    options: Arc<RwLock<SimulatedPeerOptions>>,
    shared: Arc<PeerShared>,
}

impl SimulatedTransportFactory {
    pub fn new(options: SimulatedPeerOptions) -> Self {
        Self {
            options: Arc::new(RwLock::new(options)),
            shared: Arc::new(PeerShared::default()),
        }
    }

    /// Snapshot of what the peer has observed
    pub fn log(&self) -> PeerLog {
        self.shared
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Change behaviour for subsequent connections and messages
    pub fn update_options(&self, f: impl FnOnce(&mut SimulatedPeerOptions)) {
        let mut options = self.options.write().unwrap_or_else(|e| e.into_inner());
        f(&mut options);
    }

    /// Push a peer-initiated frame to the current connection
    pub fn push(&self, envelope: &Envelope) -> Result<()> {
        let conn = self
            .current()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .ok_or_else(|| Error::Transport("No open simulated connection".to_string()))?;
        let text = serde_json::to_string(envelope)?;
        conn.events
            .send(TransportEvent::Message(text))
            .map_err(|_| Error::Transport("Simulated connection receiver dropped".to_string()))
    }

    /// Close the current connection from the peer side
    pub fn drop_connection(&self, code: u16, reason: &str) {
        if let Some(conn) = self.current() {
            conn.shut(code, reason);
        }
    }

    fn current(&self) -> Option<Arc<PeerConnection>> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn options(&self) -> SimulatedPeerOptions {
        self.options.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TransportFactory for SimulatedTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn open(&self, url: &str, events: TransportEvents) -> Box<dyn Transport> {
        let conn = Arc::new(PeerConnection {
            events,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        self.shared.log.lock().unwrap_or_else(|e| e.into_inner()).opened += 1;
        *self.shared.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());

        let options = self.options();
        let opening = conn.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(options.open_delay).await;
            if opening.closed.load(Ordering::SeqCst) {
                return;
            }
            if options.refuse_connections {
                let _ = opening.events.send(TransportEvent::Error {
                    fault: TransportFault::Refused,
                    message: format!("simulated peer refused connection to {}", url),
                });
                opening.shut(close_code::ABNORMAL, "connection refused");
                return;
            }
            opening.open.store(true, Ordering::SeqCst);
            let _ = opening.events.send(TransportEvent::Open);
        });

        Box::new(SimulatedTransport {
            conn,
            factory: self.clone(),
        })
    }
}

/// One connection to the simulated peer
pub struct SimulatedTransport {
    conn: Arc<PeerConnection>,
    factory: SimulatedTransportFactory,
}

impl Transport for SimulatedTransport {
    fn is_open(&self) -> bool {
        self.conn.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport("Simulated transport is not open".to_string()));
        }
        let envelope = Envelope::parse(&text)?;
        let options = self.factory.options();

        let replies = {
            let mut log = self.factory.shared.log.lock().unwrap_or_else(|e| e.into_inner());
            log.received.push(envelope.clone());
            let replies = respond(&envelope, &options);
            if let Some(mode) = connect_mode(&envelope) {
                log.connect_modes.push(mode);
            }
            replies
        };

        if replies.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();
        let delay = options.reply_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for reply in replies {
                if !conn.open.load(Ordering::SeqCst) {
                    return;
                }
                match serde_json::to_string(&reply) {
                    Ok(text) => {
                        let _ = conn.events.send(TransportEvent::Message(text));
                    }
                    Err(e) => tracing::warn!("Failed to serialize simulated reply: {}", e),
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        self.conn.shut(close_code::NORMAL, "closed by client");
    }
}

/// Request body regardless of dialect
fn body(env: &Envelope) -> &Value {
    env.payload
        .as_ref()
        .or(env.params.as_ref())
        .unwrap_or(&Value::Null)
}

/// Operation name regardless of dialect
fn operation(env: &Envelope) -> &str {
    match (env.kind.as_str(), env.method.as_deref()) {
        ("req", Some("connect")) | ("connect", _) => "connect",
        ("req", Some("health")) | ("ping", _) => "ping",
        ("req", Some("tool.call")) | ("tool_call", _) => "tool",
        ("req", Some("chat.send")) | ("chat_message", _) => "chat",
        ("req", Some("chat.history")) | ("request_history", _) => "history",
        _ => "other",
    }
}

fn connect_mode(env: &Envelope) -> Option<String> {
    if operation(env) != "connect" {
        return None;
    }
    body(env)["client"]["mode"].as_str().map(str::to_string)
}

/// Build a success or error reply in the request's dialect
fn reply(env: &Envelope, legacy_type: &str, data: Value, error: Option<String>) -> Envelope {
    let id = env.id.clone().unwrap_or_default();
    if env.kind == "req" {
        let res = Envelope::response(id, error.is_none());
        match error {
            Some(message) => res.with_error(json!({ "code": "INVALID_REQUEST", "message": message })),
            None => res.with_payload(data),
        }
    } else {
        let mut msg = Envelope::new(legacy_type).with_id(id).with_payload(data);
        if let Some(message) = error {
            msg.ok = Some(false);
            msg.error = Some(Value::String(message));
        }
        msg
    }
}

fn respond(env: &Envelope, options: &SimulatedPeerOptions) -> Vec<Envelope> {
    match operation(env) {
        "connect" => {
            let mode = connect_mode(env).unwrap_or_default();
            if options.rejected_modes.iter().any(|m| m == &mode) {
                let message = format!(
                    "invalid connect params: at /client/mode: unsupported client.mode \"{}\"",
                    mode
                );
                return vec![reply(env, "connect_ack", Value::Null, Some(message))];
            }
            if !options.ack_handshake {
                return Vec::new();
            }
            vec![reply(
                env,
                "connect_ack",
                json!({ "type": "hello-ok", "protocol": super::envelope::PROTOCOL_VERSION, "mode": mode }),
                None,
            )]
        }
        "ping" if options.answer_pings => {
            if env.kind == "req" {
                vec![reply(env, "pong", json!({ "status": "ok" }), None)]
            } else {
                vec![Envelope {
                    kind: "pong".to_string(),
                    id: env.id.clone(),
                    ..Default::default()
                }]
            }
        }
        "tool" if options.answer_tools => {
            let name = body(env)["name"].as_str().unwrap_or_default().to_string();
            let error = options
                .failing_tools
                .iter()
                .any(|t| t == &name)
                .then(|| format!("Tool {} failed", name));
            let data = json!({
                "tool": name,
                "args": body(env)["args"].clone(),
                "output": "simulated",
            });
            vec![reply(env, "tool_result", data, error)]
        }
        "chat" => {
            let text = body(env)["text"].as_str().unwrap_or_default();
            let echo = Envelope::new("chat_message").with_payload(json!({
                "role": "assistant",
                "text": format!("(simulated) {}", text),
            }));
            if env.kind == "req" {
                vec![reply(env, "chat_message", json!({ "accepted": true }), None), echo]
            } else {
                vec![echo]
            }
        }
        "history" => {
            let batch = json!({ "messages": [] });
            let event = Envelope::new("history_batch")
                .with_id(env.id.clone().unwrap_or_default())
                .with_payload(batch);
            if env.kind == "req" {
                vec![reply(env, "history_batch", json!({ "accepted": true }), None), event]
            } else {
                vec![event]
            }
        }
        _ => Vec::new(),
    }
}
