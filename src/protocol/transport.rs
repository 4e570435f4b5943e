//! Transport adapter abstraction
//!
//! A transport is a persistent bidirectional text channel to the gateway.
//! Opening one returns a handle immediately; lifecycle and inbound frames
//! are delivered asynchronously on the supplied [`TransportEvents`] sender,
//! mirroring how a socket reports `open`/`message`/`close`/`error`.

use crate::error::Result;
use serde::Serialize;
use tokio::sync::mpsc;

/// Which implementation backs a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Real network socket
    Network,
    /// In-process simulated peer (safe mode)
    Simulated,
}

/// Diagnostic category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    Refused,
    PolicyViolation,
    HandshakeFailure,
    Closed,
    Other,
}

/// WebSocket close codes the client distinguishes
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const ABNORMAL: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;
}

impl TransportFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refused => "refused",
            Self::PolicyViolation => "policy_violation",
            Self::HandshakeFailure => "handshake_failure",
            Self::Closed => "closed",
            Self::Other => "other",
        }
    }

    pub fn from_close_code(code: u16) -> Self {
        match code {
            close_code::POLICY_VIOLATION => Self::PolicyViolation,
            close_code::PROTOCOL_ERROR => Self::HandshakeFailure,
            _ => Self::Closed,
        }
    }

    /// Best-effort categorisation of an error description
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("refused") {
            Self::Refused
        } else if lower.contains("policy") {
            Self::PolicyViolation
        } else if lower.contains("handshake")
            || lower.contains("401")
            || lower.contains("403")
            || lower.contains("upgrade")
        {
            Self::HandshakeFailure
        } else {
            Self::Other
        }
    }
}

impl std::fmt::Display for TransportFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and data events raised by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Closed { code: u16, reason: String },
    Error { fault: TransportFault, message: String },
}

/// Sink for transport events
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// A single open (or opening) connection
pub trait Transport: Send + Sync {
    /// True once `Open` has been raised and until the transport closes
    fn is_open(&self) -> bool;

    /// Queue a text frame; fails if the transport is not open
    fn send(&self, text: String) -> Result<()>;

    /// Begin closing; a `Closed` event follows unless already closed
    fn close(&self);
}

/// Creates transports for the protocol client
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start opening a transport to `url`. Must be called inside a Tokio runtime.
    fn open(&self, url: &str, events: TransportEvents) -> Box<dyn Transport>;
}
