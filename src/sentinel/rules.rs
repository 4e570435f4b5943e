//! Base judgment rules
//!
//! Pure functions mapping a [`HealthSnapshot`] to a status per check. Retry
//! counting and escalation are layered on top by the engine.

use super::types::{AgentHeartbeat, CheckName, CheckStatus, HealthSnapshot};

/// Reconnect attempts above which the gateway is considered degraded
pub const RECONNECT_DEGRADED_THRESHOLD: u32 = 2;

/// Round-trip latency above which providers are considered degraded
pub const PROVIDER_LATENCY_DEGRADED_MS: u64 = 1200;

/// Heartbeats older than this mark an agent as stale
pub const AGENT_STALE_AFTER_MS: u64 = 5 * 60 * 1000;

/// Base judgment for one check, before retry accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub status: CheckStatus,
    pub error_summary: Option<String>,
}

impl Judgment {
    fn ok() -> Self {
        Self {
            status: CheckStatus::Ok,
            error_summary: None,
        }
    }

    fn degraded(summary: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Degraded,
            error_summary: Some(summary.into()),
        }
    }

    fn down(summary: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Down,
            error_summary: Some(summary.into()),
        }
    }
}

/// Evaluate a single check against the snapshot
pub fn evaluate(name: CheckName, snapshot: &HealthSnapshot, now: u64) -> Judgment {
    match name {
        CheckName::Gateway => gateway(snapshot),
        CheckName::Agents => agents(&snapshot.agents, now),
        CheckName::Tools => tools(snapshot),
        CheckName::Providers => providers(snapshot),
    }
}

fn gateway(snapshot: &HealthSnapshot) -> Judgment {
    let gw = &snapshot.gateway;
    if !gw.connected && !snapshot.safe_mode {
        return Judgment::down("Gateway disconnected");
    }
    if gw.reconnect_attempts > RECONNECT_DEGRADED_THRESHOLD {
        return Judgment::degraded(format!(
            "Gateway unstable: {} reconnect attempts",
            gw.reconnect_attempts
        ));
    }
    if !gw.connected {
        return Judgment::degraded("Simulated gateway session not ready");
    }
    Judgment::ok()
}

fn agents(heartbeats: &[AgentHeartbeat], now: u64) -> Judgment {
    if heartbeats.is_empty() {
        return Judgment::ok();
    }

    let stale: Vec<&str> = heartbeats
        .iter()
        .filter(|h| now.saturating_sub(h.last_seen) > AGENT_STALE_AFTER_MS)
        .map(|h| h.agent_id.as_str())
        .collect();

    if stale.len() == heartbeats.len() {
        return Judgment::down(format!("All agents stale: {}", stale.join(", ")));
    }

    let errored: Vec<String> = heartbeats
        .iter()
        .filter_map(|h| h.error.as_ref().map(|e| format!("{} ({})", h.agent_id, e)))
        .collect();

    match (stale.is_empty(), errored.is_empty()) {
        (true, true) => Judgment::ok(),
        (false, _) => Judgment::degraded(format!("Stale agents: {}", stale.join(", "))),
        (true, false) => Judgment::degraded(format!("Agents reporting errors: {}", errored.join(", "))),
    }
}

fn tools(snapshot: &HealthSnapshot) -> Judgment {
    if !snapshot.gateway.connected && !snapshot.safe_mode {
        return Judgment::degraded("Tool calls unavailable while gateway is disconnected");
    }
    Judgment::ok()
}

fn providers(snapshot: &HealthSnapshot) -> Judgment {
    let gw = &snapshot.gateway;
    if !gw.connected && !snapshot.safe_mode {
        return Judgment::down("Providers unreachable: gateway disconnected");
    }
    match gw.latency_ms {
        Some(latency) if latency > PROVIDER_LATENCY_DEGRADED_MS => {
            Judgment::degraded(format!("High gateway latency: {}ms", latency))
        }
        _ => Judgment::ok(),
    }
}
