//! Gateway Sentinel - resilient Gateway client with a reliability watchdog
//!
//! Keeps a long-lived control-plane session with an agent-orchestration
//! Gateway and continuously judges the health of that connection and the
//! subsystems behind it, escalating persistent failures into an append-only
//! audit trail.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        HealthScheduler                       │
//! │   tick ─► SnapshotSource ─► ReliabilityEngine ─► maintenance │
//! └───────────────┬──────────────────────────┬───────────────────┘
//!                 │ connection status        │ checks / audit
//! ┌───────────────▼──────────────┐  ┌────────▼───────────────────┐
//! │        GatewayClient         │  │       SentinelStore        │
//! │  handshake, mode fallback,   │  │  health-checks.json        │
//! │  correlated tool calls,      │  │  sentinel-config.json      │
//! │  latency probes, backoff     │  │  audit-log.json            │
//! └───────────────┬──────────────┘  └────────────────────────────┘
//!                 │ Transport
//!        ┌────────┴─────────┐
//!   WebSocket          Simulated peer (safe mode)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire envelope, transports and the [`GatewayClient`]
//! - [`sentinel`]: health checks, escalation, persistence and audit
//! - [`scheduler`]: periodic health runs and maintenance tasks
//! - [`clock`]: injected wall clock
//! - [`config`]: Configuration management

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod sentinel;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use protocol::GatewayClient;
pub use sentinel::ReliabilityEngine;
