//! JSON file-per-run storage
//!
//! Each run lives in `<data_dir>/runs/run-<id>.json`. Writes go to a
//! temporary file that is renamed over the previous version.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{RunFilter, RunStore, RunTable, StoreError, UpdateOutcome};
use crate::lifecycle::RunUpdate;
use crate::models::{NewRun, Run, RunId};

/// Durable run store backed by a directory of JSON documents
#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    table: Mutex<RunTable>,
}

impl FileRunStore {
    /// Open the store, loading every run found under `data_dir/runs`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("runs");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;

        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.extension().map(|e| e == "json").unwrap_or(false) {
                continue;
            }
            match load_from_path(&path) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping unreadable run file {}: {:#}", path.display(), e),
            }
        }

        info!("Loaded {} runs from {}", runs.len(), dir.display());
        Ok(Self {
            dir,
            table: Mutex::new(RunTable::from_runs(runs)),
        })
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.dir.join(format!("run-{id}.json"))
    }

    fn save(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.run_path(run.id);
        let tmp = path.with_extension("json.tmp");
        let persist = |source| StoreError::Persist { id: run.id, source };

        let file = File::create(&tmp).map_err(persist)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, run)
            .map_err(|e| persist(std::io::Error::other(e)))?;
        writer.flush().map_err(persist)?;
        writer.get_ref().sync_all().map_err(persist)?;
        fs::rename(&tmp, &path).map_err(persist)?;

        debug!("Saved run {} (version {}) to {}", run.id, run.version, path.display());
        Ok(())
    }
}

fn load_from_path(path: &Path) -> Result<Run> {
    let file = File::open(path).context("Failed to open run file")?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).context("Failed to parse run file")
}

impl RunStore for FileRunStore {
    fn insert(&self, request: NewRun, dataset_version: Option<String>) -> Result<Run, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let run = table.insert(request, dataset_version);
        if let Err(e) = self.save(&run) {
            table.remove(run.id);
            return Err(e);
        }
        Ok(run)
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
        let previous = table.get(id)?;
        let outcome = table.apply(id, update, Utc::now())?;
        if outcome.applied.changed {
            if let Err(e) = self.save(&outcome.run) {
                table.restore(previous);
                return Err(e);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, ShardResult, ShardStatus, TestCounts};
    use tempfile::TempDir;

    #[test]
    fn test_runs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = FileRunStore::open(dir.path()).unwrap();
            let run = store
                .insert(NewRun::default(), Some("v3".to_string()))
                .unwrap();
            store
                .apply(run.id, RunUpdate::Dispatched { shard_total: 2 })
                .unwrap();
            store
                .apply(
                    run.id,
                    RunUpdate::ShardFinished {
                        shard_index: 1,
                        shard_total: None,
                        result: ShardResult::new(ShardStatus::Failed, TestCounts::new(3, 2, 0)),
                    },
                )
                .unwrap();
            run.id
        };

        let store = FileRunStore::open(dir.path()).unwrap();
        let run = store.get(id).unwrap();
        assert_eq!(run.status, RunStatus::Provisioning);
        assert_eq!(run.run_metadata.shard_total, Some(2));
        assert_eq!(run.failed_tests, 2);
        assert_eq!(run.dataset_version.as_deref(), Some("v3"));

        let next = store.insert(NewRun::default(), None).unwrap();
        assert_eq!(next.id, id + 1);
    }

    #[test]
    fn test_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("runs")).unwrap();
        fs::write(dir.path().join("runs/run-7.json"), "{not json").unwrap();

        let store = FileRunStore::open(dir.path()).unwrap();
        assert!(store.list(&RunFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        store.insert(NewRun::default(), None).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("runs"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["run-1.json".to_string()]);
    }
}
