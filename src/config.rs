//! Gateway Sentinel configuration management

use crate::error::{Error, Result};
use crate::protocol::{validate_endpoint, ClientOptions, ReconnectPolicy, DEFAULT_CLIENT_MODES};
use crate::sentinel::{JsonFileStore, SentinelConfig, DEFAULT_MAX_AUDIT_ENTRIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Gateway connection
    pub gateway: GatewayConfig,

    /// Sentinel settings used until a config has been persisted
    pub sentinel: SentinelConfig,

    /// Periodic scheduler
    pub scheduler: SchedulerConfig,

    /// Persistence
    pub storage: StorageConfig,
}

/// Gateway connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway WebSocket endpoint
    pub url: String,

    /// Auth token sent in the connect request
    pub token: Option<String>,

    /// Run against the in-process simulated peer
    pub safe_mode: bool,

    /// Client modes tried in order during the handshake
    pub client_modes: Vec<String>,

    /// Tool call timeout in seconds
    pub request_timeout_secs: u64,

    /// Latency probe interval in seconds
    pub latency_probe_secs: u64,

    /// Ack fallback for the simulated peer in milliseconds
    pub handshake_fallback_ms: u64,

    pub reconnect: ReconnectConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            safe_mode: false,
            client_modes: DEFAULT_CLIENT_MODES.iter().map(|m| m.to_string()).collect(),
            request_timeout_secs: 30,
            latency_probe_secs: 15,
            handshake_fallback_ms: 1500,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Pause before reopening on a forced reconnect
    pub settle_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            settle_delay_ms: 250,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// Tick period in seconds
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the health history, sentinel config and audit trail
    pub base_dir: PathBuf,

    /// Tail cap of the audit trail
    pub max_audit_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: JsonFileStore::default_dir(),
            max_audit_entries: DEFAULT_MAX_AUDIT_ENTRIES,
        }
    }
}

impl AppConfig {
    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Strip surrounding whitespace from the endpoint so the stored form is dialable
    pub fn normalize(&mut self) {
        self.gateway.url = self.gateway.url.trim().to_string();
    }

    pub fn validate(&self) -> Result<()> {
        validate_endpoint(&self.gateway.url)?;
        if self.gateway.client_modes.is_empty() {
            return Err(Error::Config(
                "gateway.client_modes must not be empty".to_string(),
            ));
        }
        if self.gateway.request_timeout_secs == 0 {
            return Err(Error::Config(
                "gateway.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.gateway.reconnect.base_delay_ms > self.gateway.reconnect.max_delay_ms {
            return Err(Error::Config(
                "gateway.reconnect.base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

impl GatewayConfig {
    /// Protocol client settings
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            url: self.url.trim().to_string(),
            token: self.token.clone().filter(|t| !t.is_empty()),
            safe_mode: self.safe_mode,
            client_modes: self.client_modes.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            latency_probe_interval: Duration::from_secs(self.latency_probe_secs.max(1)),
            handshake_fallback: Duration::from_millis(self.handshake_fallback_ms),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(self.reconnect.base_delay_ms),
                Duration::from_millis(self.reconnect.max_delay_ms),
            ),
            settle_delay: Duration::from_millis(self.reconnect.settle_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.url, "ws://127.0.0.1:18789");
        assert!(!config.gateway.safe_mode);
        assert_eq!(config.gateway.client_modes[0], "cli");
        assert_eq!(config.gateway.client_modes.len(), 5);
        assert_eq!(config.sentinel, SentinelConfig::default());
        assert!(config.scheduler.enabled);
        assert_eq!(config.storage.max_audit_entries, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            url = "wss://gw.example.com/ws"
            safe_mode = true

            [gateway.reconnect]
            max_delay_ms = 10000

            [sentinel]
            retriesBeforeEscalation = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.url, "wss://gw.example.com/ws");
        assert!(config.gateway.safe_mode);
        assert_eq!(config.gateway.request_timeout_secs, 30);
        assert_eq!(config.gateway.reconnect.base_delay_ms, 1000);
        assert_eq!(config.gateway.reconnect.max_delay_ms, 10_000);
        assert_eq!(config.sentinel.retries_before_escalation, 5);
        assert_eq!(config.sentinel.check_interval_minutes, 5);
        assert_eq!(config.scheduler.tick_secs, 60);
    }

    #[test]
    fn test_client_options_conversion() {
        let mut gateway = GatewayConfig::default();
        gateway.token = Some(String::new());
        let options = gateway.client_options();
        assert!(options.token.is_none());
        assert_eq!(options.request_timeout, Duration::from_secs(30));
        assert_eq!(options.reconnect.delay(0), Duration::from_secs(1));
        assert_eq!(options.reconnect.delay(10), Duration::from_secs(30));
        assert_eq!(options.settle_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.gateway.url = "http://localhost".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidEndpoint(_))));

        let mut config = AppConfig::default();
        config.gateway.client_modes.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.gateway.reconnect.base_delay_ms = 60_000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.gateway.url = "ws://10.0.0.5:18789".to_string();
        config.storage.base_dir = dir.path().join("state");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.gateway.url, "ws://10.0.0.5:18789");
        assert_eq!(loaded.storage.base_dir, dir.path().join("state"));
    }

    #[test]
    fn test_padded_endpoint_is_normalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nurl = \"  ws://gw.example.com:18789  \"\n").unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.gateway.url, "ws://gw.example.com:18789");

        let mut gateway = GatewayConfig::default();
        gateway.url = " wss://gw.example.com/ws ".to_string();
        assert_eq!(gateway.client_options().url, "wss://gw.example.com/ws");
    }

    #[test]
    fn test_load_missing_or_invalid_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            AppConfig::load(&dir.path().join("missing.toml")),
            Err(Error::Config(_))
        ));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "gateway = 3").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));

        assert!(AppConfig::load_or_default(None).is_ok());
    }
}
