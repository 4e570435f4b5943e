//! Reliability engine
//!
//! Judges a fixed set of named checks, carries consecutive-failure counts
//! forward from the previous entry of the same name, escalates severity once
//! a check keeps failing past the configured threshold and records every
//! failure and recovery in the audit trail.

use super::rules;
use super::store::SentinelStore;
use super::types::*;
use crate::clock::Clock;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Actor recorded on audit entries written by the engine
pub const AUDIT_ACTOR: &str = "sentinel";

/// Default tail cap of the audit trail
pub const DEFAULT_MAX_AUDIT_ENTRIES: usize = 2000;

/// Point-in-time health judgment with persisted history
pub struct ReliabilityEngine {
    store: Arc<dyn SentinelStore>,
    clock: Arc<dyn Clock>,
    /// Used until a config has been persisted
    defaults: SentinelConfig,
    max_audit_entries: usize,
    /// Serializes runs so each read-modify-write sees the previous one
    run_lock: Mutex<()>,
}

impl ReliabilityEngine {
    /// Create an engine over the given store and clock
    pub fn new(store: Arc<dyn SentinelStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            defaults: SentinelConfig::default(),
            max_audit_entries: DEFAULT_MAX_AUDIT_ENTRIES,
            run_lock: Mutex::new(()),
        }
    }

    /// Config returned before anything is persisted
    pub fn with_defaults(mut self, defaults: SentinelConfig) -> Self {
        self.defaults = defaults.clamped();
        self
    }

    pub fn with_audit_cap(mut self, cap: usize) -> Self {
        self.max_audit_entries = cap.max(1);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.run_lock
            .lock()
            .map_err(|_| Error::Internal("sentinel run lock poisoned".to_string()))
    }

    // =========================================================================
    // Config
    // =========================================================================

    /// Current config, clamped even if the stored file was edited by hand
    pub fn get_config(&self) -> Result<SentinelConfig> {
        Ok(self
            .store
            .load_config()?
            .map(|c| c.clamped())
            .unwrap_or_else(|| self.defaults.clone()))
    }

    /// Merge a partial update into the config, clamp and persist it
    pub fn update_config(&self, update: &SentinelConfigUpdate) -> Result<SentinelConfig> {
        let _guard = self.lock()?;
        let current = self.get_config()?;
        let next = current.merged(update);
        self.store.save_config(&next)?;

        let entry = self.audit_entry(
            "sentinel.config_updated",
            serde_json::to_value(update)?,
            format!(
                "enabled={} retries={} interval={}m maxChecks={}",
                next.enabled,
                next.retries_before_escalation,
                next.check_interval_minutes,
                next.max_stored_checks
            ),
        );
        self.store.append_audit(&[entry], self.max_audit_entries)?;

        tracing::info!(
            enabled = next.enabled,
            retries_before_escalation = next.retries_before_escalation,
            check_interval_minutes = next.check_interval_minutes,
            max_stored_checks = next.max_stored_checks,
            "Sentinel config updated"
        );
        Ok(next)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Stored checks, newest first
    pub fn latest_checks(&self, limit: Option<usize>) -> Result<Vec<HealthCheck>> {
        let mut checks = self.store.load_checks()?;
        if let Some(limit) = limit {
            checks.truncate(limit);
        }
        Ok(checks)
    }

    /// Most recent audit entries, oldest first
    pub fn audit_entries(&self, limit: Option<usize>) -> Result<Vec<AuditLogEntry>> {
        let mut entries = self.store.load_audit()?;
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    /// Summary derived from the latest stored check of every name
    pub fn get_summary(&self, safe_mode: bool) -> Result<HealthSummary> {
        let config = self.get_config()?;
        let history = self.store.load_checks()?;
        Ok(summarize(&history, &config, safe_mode))
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Evaluate all checks (or the single named one) and persist the results
    pub fn run_health_checks(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let names: Vec<CheckName> = match ctx.check_name.as_deref() {
            Some(name) => vec![name.parse()?],
            None => CheckName::ALL.to_vec(),
        };

        let _guard = self.lock()?;
        let config = self.get_config()?;
        let history = self.store.load_checks()?;
        let now = self.clock.now_millis();

        let mut checks = Vec::with_capacity(names.len());
        let mut audit = Vec::new();

        for name in names {
            let prior = history.iter().find(|c| c.check_name == name);
            let judgment = rules::evaluate(name, &ctx.snapshot, now);
            let check = self.next_check(name, judgment, prior, &config, ctx.source, now);

            if let Some(entry) = self.audit_for(&check, prior) {
                audit.push(entry);
            }
            checks.push(check);
        }

        let history = self.store.prepend_checks(&checks, config.max_stored_checks)?;
        self.store.append_audit(&audit, self.max_audit_entries)?;

        let summary = summarize(&history, &config, ctx.snapshot.safe_mode);
        tracing::info!(
            source = %ctx.source,
            checks = checks.len(),
            overall = ?summary.overall,
            "Health checks completed"
        );

        Ok(RunOutcome { checks, summary })
    }

    /// Full cron run when enabled and due, otherwise a no-op
    pub fn run_scheduled_health_checks(&self, snapshot: &HealthSnapshot) -> Result<Option<RunOutcome>> {
        let config = self.get_config()?;
        if !config.enabled {
            tracing::debug!("Sentinel disabled, skipping scheduled run");
            return Ok(None);
        }

        let now = self.clock.now_millis();
        let last_run = self.store.load_checks()?.first().map(|c| c.timestamp);
        if let Some(last) = last_run {
            let next = last.saturating_add(config.interval_millis());
            if now < next {
                tracing::debug!(next_run_at = next, "Scheduled health run not yet due");
                return Ok(None);
            }
        }

        let ctx = RunContext {
            snapshot: snapshot.clone(),
            source: CheckSource::Cron,
            check_name: None,
        };
        self.run_health_checks(&ctx).map(Some)
    }

    /// Apply retry accounting and escalation on top of a base judgment
    fn next_check(
        &self,
        name: CheckName,
        judgment: rules::Judgment,
        prior: Option<&HealthCheck>,
        config: &SentinelConfig,
        source: CheckSource,
        now: u64,
    ) -> HealthCheck {
        let status = judgment.status;
        let (retry_count, severity) = if status.is_ok() {
            (0, Severity::base(status))
        } else {
            let retry_count = prior.map(|p| p.retry_count).unwrap_or(0).saturating_add(1);
            let mut severity = if retry_count >= config.retries_before_escalation {
                Severity::escalated(status)
            } else {
                Severity::base(status)
            };
            // Still failing: never step down below what was already raised.
            if let Some(p) = prior.filter(|p| !p.status.is_ok()) {
                severity = severity.max(p.severity);
            }
            (retry_count, severity)
        };

        HealthCheck {
            id: format!("chk-{}", uuid::Uuid::new_v4()),
            timestamp: now,
            check_name: name,
            status,
            error_summary: judgment.error_summary,
            retry_count,
            severity,
            source,
        }
    }

    fn audit_for(&self, check: &HealthCheck, prior: Option<&HealthCheck>) -> Option<AuditLogEntry> {
        let params = serde_json::json!({
            "checkName": check.check_name,
            "status": check.status,
            "severity": check.severity,
            "retryCount": check.retry_count,
            "source": check.source,
        });

        if !check.status.is_ok() {
            let escalated = check.severity > Severity::base(check.status);
            let action = if escalated {
                "sentinel.escalated"
            } else {
                "sentinel.check_failed"
            };
            tracing::warn!(
                check = %check.check_name,
                status = %check.status,
                severity = %check.severity,
                retry_count = check.retry_count,
                "Health check failing"
            );
            return Some(self.audit_entry(
                action,
                params,
                check.error_summary.clone().unwrap_or_else(|| check.status.to_string()),
            ));
        }

        match prior {
            Some(p) if !p.status.is_ok() => {
                tracing::info!(
                    check = %check.check_name,
                    previous = %p.status,
                    after_retries = p.retry_count,
                    "Health check recovered"
                );
                Some(self.audit_entry(
                    "sentinel.recovered",
                    params,
                    format!("{} recovered after {} failed runs", check.check_name, p.retry_count),
                ))
            }
            _ => None,
        }
    }

    fn audit_entry(&self, action: &str, params: serde_json::Value, result_summary: String) -> AuditLogEntry {
        AuditLogEntry {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            timestamp: self.clock.now_millis(),
            actor: AUDIT_ACTOR.to_string(),
            action: action.to_string(),
            params,
            result_summary,
        }
    }
}

/// Derive the summary from a newest-first history
fn summarize(history: &[HealthCheck], config: &SentinelConfig, safe_mode: bool) -> HealthSummary {
    let mut latest: HashMap<CheckName, &HealthCheck> = HashMap::new();
    for check in history {
        latest.entry(check.check_name).or_insert(check);
    }

    let checks: Vec<HealthCheck> = CheckName::ALL
        .iter()
        .filter_map(|name| latest.get(name).map(|c| (*c).clone()))
        .collect();

    let overall = if checks.iter().any(|c| c.status == CheckStatus::Down) {
        OverallStatus::Down
    } else if checks.iter().any(|c| c.status == CheckStatus::Degraded) {
        OverallStatus::Degraded
    } else {
        OverallStatus::Ok
    };

    let last_run_at = history.iter().map(|c| c.timestamp).max();
    let next_run_at = if config.enabled {
        last_run_at.map(|t| t.saturating_add(config.interval_millis()))
    } else {
        None
    };

    HealthSummary {
        overall,
        checks,
        safe_mode,
        enabled: config.enabled,
        last_run_at,
        next_run_at,
    }
}
