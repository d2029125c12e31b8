//! Result aggregation
//!
//! Folds shard reports into the run ledger through the store's atomic
//! update path and audits every status change it causes.

use std::sync::Arc;
use tracing::{debug, info};

use super::audit::{actions, record_or_warn, AuditEvent, AuditSink};
use crate::lifecycle::RunUpdate;
use crate::models::{ResultsReport, Run, RunId, ShardResult, ShardStatus};
use crate::store::{RunStore, StoreError, UpdateOutcome};

#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn RunStore>,
    audit: Arc<dyn AuditSink>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RunStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Upsert one shard report.
    ///
    /// A report without a shard index addresses shard 0 and, unless the run
    /// was already planned, plans it as a single shard. Redelivering the same
    /// report leaves the run unchanged.
    pub fn ingest(&self, run_id: RunId, report: ResultsReport) -> Result<Run, StoreError> {
        let shard_index = report.shard_index.unwrap_or(0);
        let shard_total = report
            .shard_total
            .or(report.shard_index.is_none().then_some(1));
        let update = if report.status == ShardStatus::Running {
            RunUpdate::ShardStarted {
                shard_index,
                shard_total,
            }
        } else {
            let mut result = ShardResult::new(report.status, report.counts());
            result.detail = report.detail.clone();
            RunUpdate::ShardFinished {
                shard_index,
                shard_total,
                result,
            }
        };

        debug!(
            "Ingesting {} for run {} shard {}",
            report.status, run_id, shard_index
        );
        let mut run = self.apply(run_id, update, None)?.run;

        if !report.artifacts.is_empty() {
            let artifacts = report
                .artifacts
                .into_iter()
                .map(|mut a| {
                    a.run_id = run_id;
                    a
                })
                .collect();
            run = self
                .apply(run_id, RunUpdate::AttachArtifacts(artifacts), None)?
                .run;
        }
        Ok(run)
    }

    /// Record dispatch acceptance with the planned shard count
    pub fn mark_dispatched(&self, run_id: RunId, shard_total: u32) -> Result<Run, StoreError> {
        Ok(self
            .apply(run_id, RunUpdate::Dispatched { shard_total }, None)?
            .run)
    }

    /// Cancel a queued or provisioning run
    pub fn cancel(
        &self,
        run_id: RunId,
        reason: Option<String>,
        actor: Option<&str>,
    ) -> Result<Run, StoreError> {
        let outcome = self.apply(run_id, RunUpdate::Cancel { reason: reason.clone() }, actor)?;
        if outcome.applied.changed {
            let mut event = AuditEvent::new(actions::CANCELLED, run_id).actor(actor);
            event.detail = reason;
            record_or_warn(self.audit.as_ref(), event);
            info!("Run {} cancelled", run_id);
        }
        Ok(outcome.run)
    }

    /// Resolve a stalled run, filling unreported shards with `missing_as`
    pub fn force_resolve(
        &self,
        run_id: RunId,
        missing_as: ShardStatus,
        reason: &str,
    ) -> Result<Run, StoreError> {
        let outcome = self.apply(
            run_id,
            RunUpdate::ForceResolve {
                missing_as,
                reason: reason.to_string(),
            },
            Some("watchdog"),
        )?;
        if outcome.applied.changed {
            record_or_warn(
                self.audit.as_ref(),
                AuditEvent::new(actions::FORCE_RESOLVED, run_id)
                    .actor(Some("watchdog"))
                    .detail(reason),
            );
        }
        Ok(outcome.run)
    }

    /// Drop artifact references after their objects were deleted
    pub fn purge_artifacts(&self, run_id: RunId, deleted: usize) -> Result<Run, StoreError> {
        let outcome = self.apply(run_id, RunUpdate::PurgeArtifacts, Some("retention"))?;
        if outcome.applied.changed {
            record_or_warn(
                self.audit.as_ref(),
                AuditEvent::new(actions::ARTIFACTS_PURGED, run_id)
                    .actor(Some("retention"))
                    .detail(format!("{deleted} objects deleted")),
            );
        }
        Ok(outcome.run)
    }

    fn apply(
        &self,
        run_id: RunId,
        update: RunUpdate,
        actor: Option<&str>,
    ) -> Result<UpdateOutcome, StoreError> {
        let name = update.name();
        let outcome = self.store.apply(run_id, update)?;
        if !outcome.applied.changed {
            debug!("Update {} on run {} changed nothing", name, run_id);
        }
        for t in &outcome.applied.transitions {
            info!("Run {}: {} -> {}", run_id, t.from, t.to);
            record_or_warn(
                self.audit.as_ref(),
                AuditEvent::transition(run_id, t.from, t.to)
                    .actor(actor)
                    .detail(name),
            );
        }
        Ok(outcome)
    }
}
