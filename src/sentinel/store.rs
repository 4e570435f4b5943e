//! Sentinel persistence with file-based JSON storage
//!
//! Directory layout:
//! ```text
//! ~/.gateway-sentinel/
//! ├── health-checks.json    newest-first, capped
//! ├── sentinel-config.json  singleton
//! └── audit-log.json        append-only, tail-capped
//! ```
//!
//! Every write is a whole-file read-modify-write through a temp file and
//! rename, so readers never observe a partially written list.

use super::types::{AuditLogEntry, HealthCheck, SentinelConfig};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CHECKS_FILE: &str = "health-checks.json";
const CONFIG_FILE: &str = "sentinel-config.json";
const AUDIT_FILE: &str = "audit-log.json";

/// Durable state owned by the reliability engine
pub trait SentinelStore: Send + Sync {
    /// Stored checks, newest first
    fn load_checks(&self) -> Result<Vec<HealthCheck>>;

    /// Prepend `new_checks` (already newest-first) and keep at most `cap`
    fn prepend_checks(&self, new_checks: &[HealthCheck], cap: usize) -> Result<Vec<HealthCheck>>;

    fn load_config(&self) -> Result<Option<SentinelConfig>>;

    fn save_config(&self, config: &SentinelConfig) -> Result<()>;

    /// Stored audit entries, oldest first
    fn load_audit(&self) -> Result<Vec<AuditLogEntry>>;

    /// Append entries, dropping the oldest beyond `cap`
    fn append_audit(&self, entries: &[AuditLogEntry], cap: usize) -> Result<()>;
}

fn prepend_capped(existing: Vec<HealthCheck>, new_checks: &[HealthCheck], cap: usize) -> Vec<HealthCheck> {
    let mut merged = Vec::with_capacity(new_checks.len() + existing.len());
    merged.extend_from_slice(new_checks);
    merged.extend(existing);
    merged.truncate(cap);
    merged
}

fn append_capped(mut existing: Vec<AuditLogEntry>, entries: &[AuditLogEntry], cap: usize) -> Vec<AuditLogEntry> {
    existing.extend_from_slice(entries);
    if existing.len() > cap {
        let excess = existing.len() - cap;
        existing.drain(..excess);
    }
    existing
}

// =============================================================================
// JsonFileStore
// =============================================================================

/// JSON file store rooted at a base directory
pub struct JsonFileStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a store, creating the base directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Default base directory (~/.gateway-sentinel/)
    pub fn default_dir() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gateway-sentinel")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))
    }

    /// Read a JSON document, treating a missing file as absent and a corrupt
    /// file as absent with a warning
    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl SentinelStore for JsonFileStore {
    fn load_checks(&self) -> Result<Vec<HealthCheck>> {
        Ok(Self::read_json(&self.path(CHECKS_FILE))?.unwrap_or_default())
    }

    fn prepend_checks(&self, new_checks: &[HealthCheck], cap: usize) -> Result<Vec<HealthCheck>> {
        let _guard = self.lock()?;
        let path = self.path(CHECKS_FILE);
        let existing: Vec<HealthCheck> = Self::read_json(&path)?.unwrap_or_default();
        let merged = prepend_capped(existing, new_checks, cap);
        Self::write_json(&path, &merged)?;
        Ok(merged)
    }

    fn load_config(&self) -> Result<Option<SentinelConfig>> {
        Self::read_json(&self.path(CONFIG_FILE))
    }

    fn save_config(&self, config: &SentinelConfig) -> Result<()> {
        let _guard = self.lock()?;
        Self::write_json(&self.path(CONFIG_FILE), config)
    }

    fn load_audit(&self) -> Result<Vec<AuditLogEntry>> {
        Ok(Self::read_json(&self.path(AUDIT_FILE))?.unwrap_or_default())
    }

    fn append_audit(&self, entries: &[AuditLogEntry], cap: usize) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock()?;
        let path = self.path(AUDIT_FILE);
        let existing: Vec<AuditLogEntry> = Self::read_json(&path)?.unwrap_or_default();
        Self::write_json(&path, &append_capped(existing, entries, cap))
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Default)]
struct MemoryState {
    checks: Vec<HealthCheck>,
    config: Option<SentinelConfig>,
    audit: Vec<AuditLogEntry>,
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))
    }
}

impl SentinelStore for MemoryStore {
    fn load_checks(&self) -> Result<Vec<HealthCheck>> {
        Ok(self.state()?.checks.clone())
    }

    fn prepend_checks(&self, new_checks: &[HealthCheck], cap: usize) -> Result<Vec<HealthCheck>> {
        let mut state = self.state()?;
        let existing = std::mem::take(&mut state.checks);
        state.checks = prepend_capped(existing, new_checks, cap);
        Ok(state.checks.clone())
    }

    fn load_config(&self) -> Result<Option<SentinelConfig>> {
        Ok(self.state()?.config.clone())
    }

    fn save_config(&self, config: &SentinelConfig) -> Result<()> {
        self.state()?.config = Some(config.clone());
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditLogEntry>> {
        Ok(self.state()?.audit.clone())
    }

    fn append_audit(&self, entries: &[AuditLogEntry], cap: usize) -> Result<()> {
        let mut state = self.state()?;
        let existing = std::mem::take(&mut state.audit);
        state.audit = append_capped(existing, entries, cap);
        Ok(())
    }
}
