//! Sentinel data model
//!
//! Wire and storage types for health checks, the singleton sentinel config,
//! derived summaries and the audit trail. All types use camelCase JSON.

use serde::{Deserialize, Serialize};

/// Named checks evaluated on every full run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Gateway,
    Agents,
    Tools,
    Providers,
}

impl CheckName {
    /// Every check, in evaluation order
    pub const ALL: [CheckName; 4] = [
        CheckName::Gateway,
        CheckName::Agents,
        CheckName::Tools,
        CheckName::Providers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Agents => "agents",
            Self::Tools => "tools",
            Self::Providers => "providers",
        }
    }
}

impl std::fmt::Display for CheckName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway" => Ok(Self::Gateway),
            "agents" => Ok(Self::Agents),
            "tools" => Ok(Self::Tools),
            "providers" => Ok(Self::Providers),
            other => Err(crate::Error::UnknownCheck(other.to_string())),
        }
    }
}

/// Health classification of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Degraded,
    Down,
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a check on its first failure
    pub fn base(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Ok => Self::Low,
            CheckStatus::Degraded => Self::Medium,
            CheckStatus::Down => Self::High,
        }
    }

    /// Severity once a check has failed past the escalation threshold
    pub fn escalated(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Ok => Self::Low,
            CheckStatus::Degraded => Self::High,
            CheckStatus::Down => Self::Critical,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// What triggered a health run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    Manual,
    Cron,
    Retry,
}

impl std::fmt::Display for CheckSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Cron => write!(f, "cron"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// A single persisted health check result. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub id: String,
    pub timestamp: u64,
    pub check_name: CheckName,
    pub status: CheckStatus,
    pub error_summary: Option<String>,
    pub retry_count: u32,
    pub severity: Severity,
    pub source: CheckSource,
}

/// Bounds applied to every config write
pub const RETRIES_RANGE: (u32, u32) = (1, 20);
pub const INTERVAL_MINUTES_RANGE: (u32, u32) = (1, 1440);
pub const MAX_STORED_CHECKS_RANGE: (usize, usize) = (50, 5000);

/// Singleton sentinel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SentinelConfig {
    pub enabled: bool,
    pub retries_before_escalation: u32,
    pub check_interval_minutes: u32,
    pub max_stored_checks: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries_before_escalation: 3,
            check_interval_minutes: 5,
            max_stored_checks: 500,
        }
    }
}

impl SentinelConfig {
    /// Return a copy with every numeric field clamped into its allowed range
    pub fn clamped(&self) -> Self {
        Self {
            enabled: self.enabled,
            retries_before_escalation: self
                .retries_before_escalation
                .clamp(RETRIES_RANGE.0, RETRIES_RANGE.1),
            check_interval_minutes: self
                .check_interval_minutes
                .clamp(INTERVAL_MINUTES_RANGE.0, INTERVAL_MINUTES_RANGE.1),
            max_stored_checks: self
                .max_stored_checks
                .clamp(MAX_STORED_CHECKS_RANGE.0, MAX_STORED_CHECKS_RANGE.1),
        }
    }

    /// Apply a partial update, then clamp
    pub fn merged(&self, update: &SentinelConfigUpdate) -> Self {
        Self {
            enabled: update.enabled.unwrap_or(self.enabled),
            retries_before_escalation: update
                .retries_before_escalation
                .unwrap_or(self.retries_before_escalation),
            check_interval_minutes: update
                .check_interval_minutes
                .unwrap_or(self.check_interval_minutes),
            max_stored_checks: update.max_stored_checks.unwrap_or(self.max_stored_checks),
        }
        .clamped()
    }

    pub fn interval_millis(&self) -> u64 {
        u64::from(self.check_interval_minutes) * 60_000
    }
}

/// Partial config update request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelConfigUpdate {
    pub enabled: Option<bool>,
    pub retries_before_escalation: Option<u32>,
    pub check_interval_minutes: Option<u32>,
    pub max_stored_checks: Option<usize>,
}

/// Overall status across the latest check of every name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Ok,
    Degraded,
    Down,
}

/// Summary derived on demand from the latest check per name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub overall: OverallStatus,
    pub checks: Vec<HealthCheck>,
    pub safe_mode: bool,
    pub enabled: bool,
    pub last_run_at: Option<u64>,
    pub next_run_at: Option<u64>,
}

/// Append-only audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: u64,
    pub actor: String,
    pub action: String,
    pub params: serde_json::Value,
    pub result_summary: String,
}

/// Point-in-time gateway connection signals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub reconnect_attempts: u32,
}

/// Last heartbeat reported by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub last_seen: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Signals gathered before a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub safe_mode: bool,
    pub gateway: GatewaySnapshot,
    pub agents: Vec<AgentHeartbeat>,
}

/// Input to a health run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub snapshot: HealthSnapshot,
    pub source: CheckSource,
    /// Restrict the run to a single check by name
    pub check_name: Option<String>,
}

impl RunContext {
    pub fn manual(snapshot: HealthSnapshot) -> Self {
        Self {
            snapshot,
            source: CheckSource::Manual,
            check_name: None,
        }
    }

    pub fn with_check(mut self, name: impl Into<String>) -> Self {
        self.check_name = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: CheckSource) -> Self {
        self.source = source;
        self
    }
}

/// Result of a health run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub checks: Vec<HealthCheck>,
    pub summary: HealthSummary,
}
