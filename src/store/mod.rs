//! Run persistence
//!
//! Every mutation goes through [`RunStore::apply`], which runs the lifecycle
//! state machine under the store's lock.

mod file;
mod memory;

pub use file::FileRunStore;
pub use memory::MemoryRunStore;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::lifecycle::{self, Applied, LifecycleError, RunUpdate};
use crate::models::{NewRun, Run, RunId, RunStatus};

/// Default page size of `list`
pub const DEFAULT_LIMIT: usize = 100;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Failed to persist run {id}: {source}")]
    Persist {
        id: RunId,
        #[source]
        source: std::io::Error,
    },

    #[error("Run store lock poisoned")]
    Poisoned,
}

/// Result of an applied update
#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    pub run: Run,
    pub applied: Applied,
}

/// Query filter for listing runs
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RunFilter {
    pub project_id: Option<u64>,
    pub suite_id: Option<u64>,
    pub environment_id: Option<u64>,
    pub status: Option<RunStatus>,
    pub branch: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.project_id.map_or(true, |id| run.project_id == id)
            && self.suite_id.map_or(true, |id| run.suite_id == id)
            && self.environment_id.map_or(true, |id| run.environment_id == id)
            && self.status.map_or(true, |status| run.status == status)
            && self
                .branch
                .as_ref()
                .map_or(true, |branch| run.branch.as_ref() == Some(branch))
    }
}

/// Persistence seam for runs
pub trait RunStore: Send + Sync {
    /// Persist a new queued run and return it
    fn insert(&self, request: NewRun, dataset_version: Option<String>) -> Result<Run, StoreError>;

    fn get(&self, id: RunId) -> Result<Run, StoreError>;

    /// Runs matching the filter, newest first
    fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Runs that are neither queued nor terminal
    fn active(&self) -> Result<Vec<Run>, StoreError> {
        let all = self.list(&RunFilter {
            limit: Some(usize::MAX),
            ..Default::default()
        })?;
        Ok(all
            .into_iter()
            .filter(|r| r.status != RunStatus::Queued && !r.status.is_terminal())
            .collect())
    }

    /// Atomically apply one lifecycle update
    fn apply(&self, id: RunId, update: RunUpdate) -> Result<UpdateOutcome, StoreError>;
}

/// In-memory table shared by the store implementations
#[derive(Debug, Default)]
pub(crate) struct RunTable {
    runs: BTreeMap<RunId, Run>,
    next_id: RunId,
}

impl RunTable {
    pub(crate) fn from_runs(runs: impl IntoIterator<Item = Run>) -> Self {
        let runs: BTreeMap<RunId, Run> = runs.into_iter().map(|r| (r.id, r)).collect();
        let next_id = runs.keys().max().map(|max| max + 1).unwrap_or(1);
        Self { runs, next_id }
    }

    pub(crate) fn insert(&mut self, request: NewRun, dataset_version: Option<String>) -> Run {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        let run = Run::queued(id, request, dataset_version);
        self.runs.insert(id, run.clone());
        run
    }

    pub(crate) fn get(&self, id: RunId) -> Result<Run, StoreError> {
        self.runs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    pub(crate) fn list(&self, filter: &RunFilter) -> Vec<Run> {
        self.runs
            .values()
            .rev()
            .filter(|run| filter.matches(run))
            .skip(filter.skip.unwrap_or(0))
            .take(filter.limit.unwrap_or(DEFAULT_LIMIT))
            .cloned()
            .collect()
    }

    /// Apply an update in place; the table is untouched when the update fails
    pub(crate) fn apply(
        &mut self,
        id: RunId,
        update: RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let current = self.runs.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut run = current.clone();
        let applied = lifecycle::apply(&mut run, update, now)?;
        if applied.changed {
            self.runs.insert(id, run.clone());
        }
        Ok(UpdateOutcome { run, applied })
    }

    /// Undo an insert whose persistence failed
    pub(crate) fn remove(&mut self, id: RunId) {
        self.runs.remove(&id);
    }

    /// Restore a previous snapshot whose successor failed to persist
    pub(crate) fn restore(&mut self, run: Run) {
        self.runs.insert(run.id, run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ShardResult, ShardStatus, TestCounts};

    fn request(project_id: u64, branch: &str) -> NewRun {
        NewRun {
            project_id,
            suite_id: 1,
            environment_id: 1,
            branch: Some(branch.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_table_ids_are_sequential() {
        let mut table = RunTable::default();
        assert_eq!(table.insert(request(1, "main"), None).id, 1);
        assert_eq!(table.insert(request(1, "main"), None).id, 2);

        let reloaded = RunTable::from_runs(table.list(&RunFilter::default()));
        assert_eq!(reloaded.next_id, 3);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let mut table = RunTable::default();
        table.insert(request(1, "main"), None);
        table.insert(request(2, "main"), None);
        table.insert(request(1, "feature"), None);

        let by_project = table.list(&RunFilter {
            project_id: Some(1),
            ..Default::default()
        });
        assert_eq!(by_project.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1]);

        let by_branch = table.list(&RunFilter {
            branch: Some("main".to_string()),
            skip: Some(1),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(by_branch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_failed_update_leaves_run_untouched() {
        let mut table = RunTable::default();
        let run = table.insert(request(1, "main"), None);
        table
            .apply(run.id, RunUpdate::Dispatched { shard_total: 1 }, Utc::now())
            .unwrap();
        let before = table.get(run.id).unwrap();

        let err = table
            .apply(
                run.id,
                RunUpdate::ShardFinished {
                    shard_index: 4,
                    shard_total: None,
                    result: ShardResult::new(ShardStatus::Completed, TestCounts::default()),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Lifecycle(_)));
        assert_eq!(table.get(run.id).unwrap(), before);
    }

    #[test]
    fn test_unknown_run() {
        let mut table = RunTable::default();
        assert!(matches!(
            table.apply(9, RunUpdate::PurgeArtifacts, Utc::now()),
            Err(StoreError::NotFound(9))
        ));
    }
}
