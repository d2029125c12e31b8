use chrono::Utc;
use std::sync::Mutex;

use super::{RunFilter, RunStore, RunTable, StoreError, UpdateOutcome};
use crate::lifecycle::RunUpdate;
use crate::models::{NewRun, Run, RunId};

/// Volatile run store
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    table: Mutex<RunTable>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn insert(&self, request: NewRun, dataset_version: Option<String>) -> Result<Run, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.insert(request, dataset_version))
    }

    fn get(&self, id: RunId) -> Result<Run, StoreError> {
        self.table.lock().map_err(|_| StoreError::Poisoned)?.get(id)
    }

    fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .table
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .list(filter))
    }

    fn apply(&self, id: RunId, update: RunUpdate) -> Result<UpdateOutcome, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.apply(id, update, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, ShardResult, ShardStatus, TestCounts};
    use std::sync::Arc;

    #[test]
    fn test_concurrent_shard_reports() {
        let store = Arc::new(MemoryRunStore::new());
        let run = store.insert(NewRun::default(), None).unwrap();
        store
            .apply(run.id, RunUpdate::Dispatched { shard_total: 8 })
            .unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|index| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .apply(
                            run.id,
                            RunUpdate::ShardFinished {
                                shard_index: index,
                                shard_total: Some(8),
                                result: ShardResult::new(
                                    ShardStatus::Completed,
                                    TestCounts::new(2, 0, 1),
                                ),
                            },
                        )
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let run = store.get(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_tests, 24);
        assert_eq!(run.passed_tests, 16);
        assert_eq!(run.skipped_tests, 8);
    }

    #[test]
    fn test_active_runs() {
        let store = MemoryRunStore::new();
        let queued = store.insert(NewRun::default(), None).unwrap();
        let dispatched = store.insert(NewRun::default(), None).unwrap();
        store
            .apply(dispatched.id, RunUpdate::Dispatched { shard_total: 1 })
            .unwrap();

        let active: Vec<RunId> = store.active().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(active, vec![dispatched.id]);
        assert_ne!(queued.id, dispatched.id);
    }
}
