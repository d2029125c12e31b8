//! Audit trail of run lifecycle changes
//!
//! Recording is best effort: callers go through [`record_or_warn`] and a sink
//! failure never aborts the operation being audited.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::models::{RunId, RunStatus};

/// One audited action on a run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: &'static str, run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::unbound(action)
        }
    }

    /// Event about a request that never produced a run
    pub fn unbound(action: &'static str) -> Self {
        Self {
            at: Utc::now(),
            action,
            run_id: None,
            from: None,
            to: None,
            actor: None,
            detail: None,
        }
    }

    pub fn transition(run_id: RunId, from: RunStatus, to: RunStatus) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::new(actions::TRANSITION, run_id)
        }
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub mod actions {
    pub const CREATED: &str = "run.created";
    pub const REJECTED: &str = "run.rejected";
    pub const TRIGGERED: &str = "run.triggered";
    pub const TRANSITION: &str = "run.transition";
    pub const CANCELLED: &str = "run.cancelled";
    pub const FORCE_RESOLVED: &str = "run.force_resolved";
    pub const ARTIFACTS_PURGED: &str = "run.artifacts_purged";
}

/// Destination of audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Write an event, logging instead of failing
pub fn record_or_warn(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        warn!(
            "Failed to record audit event {} for run {:?}: {:#}",
            event.action, event.run_id, e
        );
    }
}

/// Emits audit events as tracing records
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        info!(target: "audit", "{}", line);
        Ok(())
    }
}

/// Appends audit events to a JSON-lines file
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write audit log: {}", self.path.display()))?;
        Ok(())
    }
}
