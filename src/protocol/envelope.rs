//! Gateway wire envelope
//!
//! Every control message is a JSON object `{type, id?, method?, params?,
//! payload?, result?, ok?, error?}`. Two dialects share the envelope:
//!
//! - **Legacy**: bare `type` values (`connect`, `connect_ack`, `ping`, `pong`,
//!   `tool_call`, `chat_message`, `request_history`, `history_batch`) with
//!   data carried in `payload`.
//! - **Request/response**: `type: "req"` with a `method` (`connect`,
//!   `health`, `tool.call`, ...) answered by `type: "res"` with the same id.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised in the connect request
pub const PROTOCOL_VERSION: u32 = 3;

/// Capabilities advertised in the connect request
pub const CLIENT_CAPS: &[&str] = &["tool.call", "chat", "history", "health"];

/// Raw wire envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Build a request/response dialect reply
    pub fn response(id: impl Into<String>, ok: bool) -> Self {
        Self {
            kind: "res".to_string(),
            id: Some(id.into()),
            ok: Some(ok),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    /// Parse and validate an inbound frame
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("Invalid envelope: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks per message type
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(Error::Protocol("Envelope type is empty".to_string()));
        }
        match self.kind.as_str() {
            "req" => {
                if self.id.is_none() || self.method.is_none() {
                    return Err(Error::Protocol("Request requires id and method".to_string()));
                }
            }
            "res" | "tool_call" | "tool_result" => {
                if self.id.is_none() {
                    return Err(Error::Protocol(format!("{} requires id", self.kind)));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Human-readable error text, whether `error` is a string or `{code, message}`
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
            other => other.to_string(),
        })
    }

    /// Body of an event-style message, whichever field carries it
    fn body(&self) -> Value {
        self.payload
            .clone()
            .or_else(|| self.params.clone())
            .unwrap_or(Value::Null)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Typed view of an inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Legacy handshake acknowledgement (or rejection when `ok` is false)
    ConnectAck {
        id: Option<String>,
        ok: bool,
        error: Option<String>,
    },
    /// Alternate handshake acknowledgement event
    HelloOk,
    /// Request/response dialect reply
    Response {
        id: String,
        ok: bool,
        payload: Option<Value>,
        error: Option<String>,
    },
    /// Legacy tool call reply
    ToolResult {
        id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    ChatMessage(Value),
    HistoryBatch(Value),
    Thought(Value),
    BrowserEvent(Value),
    Unknown { kind: String },
}

impl From<Envelope> for InboundMessage {
    fn from(env: Envelope) -> Self {
        let error = env.error_message();
        match env.kind.as_str() {
            "connect_ack" => Self::ConnectAck {
                ok: env.ok.unwrap_or(error.is_none()),
                error,
                id: env.id,
            },
            "hello-ok" | "hello_ok" => Self::HelloOk,
            "res" => Self::Response {
                ok: env.ok.unwrap_or(error.is_none()),
                payload: env.result.or(env.payload),
                error,
                id: env.id.unwrap_or_default(),
            },
            "tool_result" => Self::ToolResult {
                result: env.result.or(env.payload),
                error,
                id: env.id.unwrap_or_default(),
            },
            "ping" => Self::Ping { id: env.id },
            "pong" => Self::Pong { id: env.id },
            "chat_message" => Self::ChatMessage(env.body()),
            "history_batch" => Self::HistoryBatch(env.body()),
            "thought" => Self::Thought(env.body()),
            "browser_event" => Self::BrowserEvent(env.body()),
            _ => Self::Unknown {
                kind: env.kind.clone(),
            },
        }
    }
}

impl InboundMessage {
    /// Parse a text frame straight into its typed form
    pub fn parse(text: &str) -> Result<Self> {
        Envelope::parse(text).map(Self::from)
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Client identity sent in the connect request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Connect request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

impl ConnectParams {
    /// Connect parameters for this crate announcing the given client mode
    pub fn new(mode: impl Into<String>, token: Option<&str>) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: mode.into(),
            },
            caps: CLIENT_CAPS.iter().map(|c| c.to_string()).collect(),
            auth: token.map(|t| AuthParams {
                token: t.to_string(),
            }),
        }
    }
}

/// Wire dialect spoken on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Bare `type` values, used against the simulated peer
    Legacy,
    /// `req`/`res` with a `method`, used against a live gateway
    RequestResponse,
}

impl Dialect {
    /// Safe mode talks the legacy dialect, live mode the request/response one
    pub fn for_safe_mode(safe_mode: bool) -> Self {
        if safe_mode {
            Self::Legacy
        } else {
            Self::RequestResponse
        }
    }

    fn build(&self, legacy_type: &str, method: &str, id: &str, body: Value) -> Envelope {
        match self {
            Self::Legacy => Envelope::new(legacy_type).with_id(id).with_payload(body),
            Self::RequestResponse => Envelope::new("req")
                .with_id(id)
                .with_method(method)
                .with_params(body),
        }
    }

    pub fn connect(&self, id: &str, params: &ConnectParams) -> Result<Envelope> {
        Ok(self.build("connect", "connect", id, serde_json::to_value(params)?))
    }

    /// Latency probe
    pub fn ping(&self, id: &str) -> Envelope {
        let ts = chrono::Utc::now().timestamp_millis();
        self.build("ping", "health", id, serde_json::json!({ "ts": ts }))
    }

    pub fn tool_call(&self, id: &str, name: &str, args: Value) -> Envelope {
        self.build(
            "tool_call",
            "tool.call",
            id,
            serde_json::json!({ "name": name, "args": args }),
        )
    }

    pub fn chat_message(&self, id: &str, text: &str) -> Envelope {
        self.build(
            "chat_message",
            "chat.send",
            id,
            serde_json::json!({ "text": text }),
        )
    }

    pub fn request_history(&self, id: &str, limit: usize) -> Envelope {
        self.build(
            "request_history",
            "chat.history",
            id,
            serde_json::json!({ "limit": limit }),
        )
    }

    /// Reply to a peer-initiated ping
    pub fn pong(&self, id: Option<String>) -> Envelope {
        let mut env = Envelope::new("pong");
        env.id = id;
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_missing_type() {
        assert!(Envelope::parse(r#"{"id":"1"}"#).is_err());
        assert!(Envelope::parse(r#"{"type":""}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_parse_validates_req_and_res() {
        assert!(Envelope::parse(r#"{"type":"req","id":"1"}"#).is_err());
        assert!(Envelope::parse(r#"{"type":"res","ok":true}"#).is_err());
        assert!(Envelope::parse(r#"{"type":"req","id":"1","method":"health"}"#).is_ok());
    }

    #[test]
    fn test_inbound_response_with_object_error() {
        let msg = InboundMessage::parse(
            r#"{"type":"res","id":"c1","ok":false,"error":{"code":"INVALID_REQUEST","message":"invalid client.mode"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response {
                id: "c1".to_string(),
                ok: false,
                payload: None,
                error: Some("invalid client.mode".to_string()),
            }
        );
    }

    #[test]
    fn test_inbound_response_ok_defaults_from_error() {
        let msg = InboundMessage::parse(r#"{"type":"res","id":"r","result":{"v":1}}"#).unwrap();
        match msg {
            InboundMessage::Response { ok, payload, .. } => {
                assert!(ok);
                assert_eq!(payload.unwrap()["v"], 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inbound_legacy_types() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"connect_ack","id":"c"}"#).unwrap(),
            InboundMessage::ConnectAck {
                id: Some("c".to_string()),
                ok: true,
                error: None,
            }
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"hello-ok"}"#).unwrap(),
            InboundMessage::HelloOk
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"pong","id":"p"}"#).unwrap(),
            InboundMessage::Pong { id: Some("p".to_string()) }
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"thought","payload":{"text":"hmm"}}"#).unwrap(),
            InboundMessage::Thought(serde_json::json!({"text":"hmm"}))
        );
    }

    #[test]
    fn test_inbound_unknown_falls_back() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"presence.update"}"#).unwrap(),
            InboundMessage::Unknown {
                kind: "presence.update".to_string()
            }
        );
    }

    #[test]
    fn test_dialect_connect_shapes() {
        let params = ConnectParams::new("operator", Some("secret"));

        let legacy = Dialect::Legacy.connect("c1", &params).unwrap();
        assert_eq!(legacy.kind, "connect");
        assert_eq!(legacy.payload.as_ref().unwrap()["client"]["mode"], "operator");
        assert!(legacy.method.is_none());

        let req = Dialect::RequestResponse.connect("c1", &params).unwrap();
        assert_eq!(req.kind, "req");
        assert_eq!(req.method.as_deref(), Some("connect"));
        let p = req.params.as_ref().unwrap();
        assert_eq!(p["minProtocol"], PROTOCOL_VERSION);
        assert_eq!(p["auth"]["token"], "secret");
    }

    #[test]
    fn test_dialect_tool_call_shapes() {
        let args = serde_json::json!({"q": 1});
        let legacy = Dialect::Legacy.tool_call("t1", "search", args.clone());
        assert_eq!(legacy.kind, "tool_call");
        assert_eq!(legacy.payload.unwrap()["name"], "search");

        let req = Dialect::RequestResponse.tool_call("t1", "search", args);
        assert_eq!(req.method.as_deref(), Some("tool.call"));
        assert_eq!(req.params.unwrap()["args"]["q"], 1);
    }

    #[test]
    fn test_serialization_omits_absent_fields() {
        let json = Dialect::Legacy.pong(Some("p1".to_string())).to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong","id":"p1"}"#);
    }

    #[test]
    fn test_dialect_for_safe_mode() {
        assert_eq!(Dialect::for_safe_mode(true), Dialect::Legacy);
        assert_eq!(Dialect::for_safe_mode(false), Dialect::RequestResponse);
    }
}
