//! Periodic health scheduler
//!
//! Ticks on a fixed period, asks the reliability engine for a scheduled run
//! (which is itself a no-op until the configured check interval has
//! elapsed) and then runs any registered maintenance tasks.

use crate::protocol::GatewayClient;
use crate::sentinel::{HealthSnapshot, ReliabilityEngine, RunOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Supplies the signals a scheduled health run judges
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn health_snapshot(&self) -> HealthSnapshot;
}

#[async_trait::async_trait]
impl SnapshotSource for GatewayClient {
    async fn health_snapshot(&self) -> HealthSnapshot {
        let status = self.connection_status();
        HealthSnapshot {
            safe_mode: status.safe_mode,
            gateway: (&status).into(),
            agents: Vec::new(),
        }
    }
}

/// Housekeeping run after the health check on every tick
#[async_trait::async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> crate::Result<()>;
}

/// Logs the gateway connection status
pub struct ConnectionReportTask {
    client: GatewayClient,
}

impl ConnectionReportTask {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for ConnectionReportTask {
    fn name(&self) -> &str {
        "connection-report"
    }

    async fn run(&self) -> crate::Result<()> {
        let status = self.client.connection_status();
        tracing::info!(
            connected = status.connected,
            latency_ms = ?status.latency,
            reconnect_attempts = status.reconnect_attempts,
            mode = %status.client_mode,
            "Gateway connection status"
        );
        Ok(())
    }
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Set when the engine judged the checks due
    pub health: Option<RunOutcome>,
    /// Names of maintenance tasks that failed
    pub failed_tasks: Vec<String>,
}

/// Drives scheduled health runs and maintenance tasks
pub struct HealthScheduler {
    engine: Arc<ReliabilityEngine>,
    source: Arc<dyn SnapshotSource>,
    tasks: Vec<Arc<dyn MaintenanceTask>>,
    period: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthScheduler {
    pub fn new(
        engine: Arc<ReliabilityEngine>,
        source: Arc<dyn SnapshotSource>,
        period: Duration,
    ) -> Self {
        Self {
            engine,
            source,
            tasks: Vec::new(),
            period: period.max(Duration::from_secs(1)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Register a maintenance task
    pub fn with_task(mut self, task: Arc<dyn MaintenanceTask>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Run one tick now
    pub async fn tick(&self) -> crate::Result<TickReport> {
        let snapshot = self.source.health_snapshot().await;

        // File-backed persistence blocks
        let engine = self.engine.clone();
        let health = tokio::task::spawn_blocking(move || {
            engine.run_scheduled_health_checks(&snapshot)
        })
        .await
        .map_err(|e| crate::Error::Internal(format!("Health run panicked: {}", e)))??;

        if let Some(ref outcome) = health {
            tracing::info!(
                checks = outcome.checks.len(),
                overall = ?outcome.summary.overall,
                "Scheduled health run completed"
            );
        }

        let mut failed_tasks = Vec::new();
        for task in &self.tasks {
            if let Err(e) = task.run().await {
                tracing::warn!(task = task.name(), error = %e, "Maintenance task failed");
                failed_tasks.push(task.name().to_string());
            }
        }

        Ok(TickReport {
            health,
            failed_tasks,
        })
    }

    /// Spawn the tick loop
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            tracing::debug!("Health scheduler already running");
            return;
        }

        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            tracing::error!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
            tracing::info!("Health scheduler stopped");
        }));

        tracing::info!(
            period_secs = self.period.as_secs(),
            tasks = self.tasks.len(),
            "Health scheduler started"
        );
    }

    /// Stop the tick loop and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
