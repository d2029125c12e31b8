//! Run lifecycle
//!
//! The authoritative run state machine. Every mutation of a run goes through
//! [`apply`] with one narrow [`RunUpdate`]; stores call it under their lock so
//! each update is atomic and no component reads-modifies-writes a whole run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{Run, RunArtifact, RunMetadata, RunStatus, ShardResult, ShardStatus};

/// Lifecycle violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Shard index {index} out of range for {total} shards")]
    ShardOutOfRange { index: u32, total: u32 },

    #[error("Run in status {0} cannot be cancelled")]
    NotCancellable(RunStatus),

    #[error("A run must be dispatched with at least one shard")]
    EmptyPlan,
}

/// Narrow, field-scoped mutations of a run
#[derive(Clone, Debug)]
pub enum RunUpdate {
    /// The dispatcher accepted the run and planned `shard_total` shards
    Dispatched { shard_total: u32 },

    /// An executor confirmed it started a shard
    ShardStarted {
        shard_index: u32,
        shard_total: Option<u32>,
    },

    /// A shard reached a terminal outcome
    ShardFinished {
        shard_index: u32,
        shard_total: Option<u32>,
        result: ShardResult,
    },

    /// User cancellation
    Cancel { reason: Option<String> },

    /// Fill every unreported shard with `missing_as` and resolve
    ForceResolve {
        missing_as: ShardStatus,
        reason: String,
    },

    /// Record uploaded artifacts
    AttachArtifacts(Vec<RunArtifact>),

    /// Drop artifact references after retention cleanup
    PurgeArtifacts,
}

impl RunUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            RunUpdate::Dispatched { .. } => "dispatched",
            RunUpdate::ShardStarted { .. } => "shard_started",
            RunUpdate::ShardFinished { .. } => "shard_finished",
            RunUpdate::Cancel { .. } => "cancel",
            RunUpdate::ForceResolve { .. } => "force_resolve",
            RunUpdate::AttachArtifacts(_) => "attach_artifacts",
            RunUpdate::PurgeArtifacts => "purge_artifacts",
        }
    }
}

/// A status change performed by an update
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// What an update did to a run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub transitions: Vec<Transition>,
    pub changed: bool,
}

impl Applied {
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Status reached by the last transition, if any
    pub fn final_status(&self) -> Option<RunStatus> {
        self.transitions.last().map(|t| t.to)
    }
}

/// Edges of the run state machine
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Queued, Provisioning)
            | (Queued, Cancelled)
            | (Provisioning, Running)
            | (Provisioning, Reporting)
            | (Provisioning, Cancelled)
            | (Running, Reporting)
            | (Reporting, Completed)
            | (Reporting, Failed)
            | (Reporting, PartialFailed)
            | (Reporting, TimedOut)
            | (Reporting, InfraFailed)
    )
}

/// Fold shard outcomes into a run status.
///
/// Returns `None` while any outcome is still running or when there are none.
/// Precedence: timed out, then infra failure, then mixed, then uniform.
pub fn resolve<'a>(results: impl IntoIterator<Item = &'a ShardResult>) -> Option<RunStatus> {
    let statuses: Vec<ShardStatus> = results.into_iter().map(|r| r.status).collect();
    if statuses.is_empty() || statuses.iter().any(|s| !s.is_terminal()) {
        return None;
    }

    if statuses.contains(&ShardStatus::TimedOut) {
        return Some(RunStatus::TimedOut);
    }
    if statuses.contains(&ShardStatus::InfraFailed) {
        return Some(RunStatus::InfraFailed);
    }

    let completed = statuses
        .iter()
        .filter(|s| **s == ShardStatus::Completed)
        .count();
    Some(if completed == statuses.len() {
        RunStatus::Completed
    } else if completed == 0 {
        RunStatus::Failed
    } else {
        RunStatus::PartialFailed
    })
}

/// True once every planned shard holds a terminal ledger entry
pub fn is_complete(meta: &RunMetadata) -> bool {
    match meta.shard_total {
        Some(total) if total > 0 => (0..total).all(|index| {
            meta.shards
                .get(&index)
                .map(|s| s.status.is_terminal())
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// Apply one update to a run
pub fn apply(run: &mut Run, update: RunUpdate, now: DateTime<Utc>) -> Result<Applied, LifecycleError> {
    let mut applied = Applied::default();

    match update {
        RunUpdate::Dispatched { shard_total } => {
            if shard_total == 0 {
                return Err(LifecycleError::EmptyPlan);
            }
            if run.status.is_terminal() {
                return Ok(Applied::unchanged());
            }
            applied.changed |= fix_shard_total(run, Some(shard_total));
            if run.status == RunStatus::Queued {
                transition(run, RunStatus::Provisioning, now, &mut applied)?;
                run.dispatched_at = Some(now);
            }
            settle(run, now, &mut applied)?;
        }

        RunUpdate::ShardStarted {
            shard_index,
            shard_total,
        } => {
            if run.status.is_terminal() {
                return Ok(Applied::unchanged());
            }
            applied.changed |= fix_shard_total(run, shard_total);
            check_index(run, shard_index)?;

            if !run.run_metadata.shards.contains_key(&shard_index) {
                run.run_metadata
                    .shards
                    .insert(shard_index, ShardResult::running().at(now));
                applied.changed = true;
            }
            if run.status == RunStatus::Queued {
                transition(run, RunStatus::Provisioning, now, &mut applied)?;
                run.dispatched_at.get_or_insert(now);
            }
            if run.status == RunStatus::Provisioning {
                transition(run, RunStatus::Running, now, &mut applied)?;
            }
            if run.started_at.is_none() {
                run.started_at = Some(now);
                applied.changed = true;
            }
        }

        RunUpdate::ShardFinished {
            shard_index,
            shard_total,
            result,
        } => {
            if !result.status.is_terminal() {
                return apply(
                    run,
                    RunUpdate::ShardStarted {
                        shard_index,
                        shard_total,
                    },
                    now,
                );
            }
            if run.status.is_terminal() {
                return Ok(Applied::unchanged());
            }
            applied.changed |= fix_shard_total(run, shard_total);
            check_index(run, shard_index)?;

            let duplicate = run
                .run_metadata
                .shards
                .get(&shard_index)
                .map(|existing| {
                    existing.status == result.status
                        && existing.counts == result.counts
                        && existing.detail == result.detail
                })
                .unwrap_or(false);

            if !duplicate {
                run.run_metadata.shards.insert(shard_index, result);
                let merged = run.run_metadata.merged_counts();
                run.set_counts(merged);
                applied.changed = true;
            }

            if run.status == RunStatus::Queued {
                transition(run, RunStatus::Provisioning, now, &mut applied)?;
                run.dispatched_at.get_or_insert(now);
            }
            settle(run, now, &mut applied)?;
        }

        RunUpdate::Cancel { reason } => match run.status {
            RunStatus::Cancelled => return Ok(Applied::unchanged()),
            RunStatus::Queued | RunStatus::Provisioning => {
                run.status_reason = reason;
                transition(run, RunStatus::Cancelled, now, &mut applied)?;
            }
            other => return Err(LifecycleError::NotCancellable(other)),
        },

        RunUpdate::ForceResolve { missing_as, reason } => {
            if run.status.is_terminal() {
                return Ok(Applied::unchanged());
            }
            let total = run.run_metadata.shard_total.unwrap_or_else(|| {
                run.run_metadata
                    .shards
                    .keys()
                    .max()
                    .map(|max| max + 1)
                    .unwrap_or(1)
            });
            run.run_metadata.shard_total = Some(total);

            for index in 0..total {
                let pending = run
                    .run_metadata
                    .shards
                    .get(&index)
                    .map(|s| !s.status.is_terminal())
                    .unwrap_or(true);
                if pending {
                    let counts = run
                        .run_metadata
                        .shards
                        .get(&index)
                        .map(|s| s.counts)
                        .unwrap_or_default();
                    run.run_metadata.shards.insert(
                        index,
                        ShardResult::new(missing_as, counts)
                            .with_detail(reason.clone())
                            .at(now),
                    );
                }
            }
            let merged = run.run_metadata.merged_counts();
            run.set_counts(merged);
            run.status_reason = Some(reason);
            applied.changed = true;

            if run.status == RunStatus::Queued {
                transition(run, RunStatus::Provisioning, now, &mut applied)?;
            }
            settle(run, now, &mut applied)?;
        }

        RunUpdate::AttachArtifacts(artifacts) => {
            for artifact in artifacts {
                let known = run
                    .artifacts
                    .iter()
                    .any(|a| a.storage_key == artifact.storage_key);
                if !known {
                    run.artifacts.push(artifact);
                    applied.changed = true;
                }
            }
            if applied.changed {
                run.run_metadata.index_coverage(&run.artifacts);
            }
        }

        RunUpdate::PurgeArtifacts => {
            if !run.artifacts.is_empty() {
                run.artifacts.clear();
                run.run_metadata.coverage = None;
                applied.changed = true;
            }
        }
    }

    if applied.changed || !applied.transitions.is_empty() {
        run.version += 1;
    }
    Ok(applied)
}

/// Record the planned shard count once; later values never override it
fn fix_shard_total(run: &mut Run, shard_total: Option<u32>) -> bool {
    match (run.run_metadata.shard_total, shard_total) {
        (None, Some(total)) if total > 0 => {
            run.run_metadata.shard_total = Some(total);
            true
        }
        _ => false,
    }
}

fn check_index(run: &Run, shard_index: u32) -> Result<(), LifecycleError> {
    match run.run_metadata.shard_total {
        Some(total) if shard_index >= total => Err(LifecycleError::ShardOutOfRange {
            index: shard_index,
            total,
        }),
        _ => Ok(()),
    }
}

/// Move a complete run through `reporting` into its resolved terminal status
fn settle(run: &mut Run, now: DateTime<Utc>, applied: &mut Applied) -> Result<(), LifecycleError> {
    if run.status.is_terminal() || !is_complete(&run.run_metadata) {
        return Ok(());
    }

    let Some(resolved) = resolve(run.run_metadata.shards.values()) else {
        return Ok(());
    };

    if run.status != RunStatus::Reporting {
        transition(run, RunStatus::Reporting, now, applied)?;
    }
    transition(run, resolved, now, applied)
}

fn transition(
    run: &mut Run,
    to: RunStatus,
    now: DateTime<Utc>,
    applied: &mut Applied,
) -> Result<(), LifecycleError> {
    let from = run.status;
    if !can_transition(from, to) {
        return Err(LifecycleError::InvalidTransition { from, to });
    }

    run.status = to;
    if to.is_terminal() && run.completed_at.is_none() {
        run.completed_at = Some(now);
        run.duration_seconds = run.started_at.map(|started| (now - started).num_seconds());
    }

    applied.transitions.push(Transition { from, to });
    applied.changed = true;
    Ok(())
}
