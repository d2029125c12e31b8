//! Durable at-least-once task queue
//!
//! One JSON file per task under the queue directory, named by the task key.
//! A task is written and fsynced before `enqueue` returns and is deleted only
//! when acknowledged, so tasks interrupted by a crash are redelivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::models::{RunId, ShardJob};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode task {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Unit of work held by the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueTask {
    /// Fetch context, mark the run dispatched and fan out shard tasks
    PlanRun { run_id: RunId },
    /// Submit one shard to an executor
    ExecuteShard { job: ShardJob },
}

impl QueueTask {
    pub fn key(&self) -> String {
        match self {
            QueueTask::PlanRun { run_id } => format!("plan-run-{run_id}"),
            QueueTask::ExecuteShard { job } => job.key(),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            QueueTask::PlanRun { run_id } => *run_id,
            QueueTask::ExecuteShard { job } => job.run_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTask {
    task: QueueTask,
    enqueued_at: DateTime<Utc>,
}

/// File-backed queue
#[derive(Debug)]
pub struct JobQueue {
    dir: PathBuf,
    notify: Notify,
}

impl JobQueue {
    /// Open the queue directory, discarding half-written tasks
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        for entry in fs::read_dir(&dir).map_err(io_error(&dir))? {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                debug!("Removing partial task file {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self {
            dir,
            notify: Notify::new(),
        })
    }

    fn task_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Durably enqueue a task; returns false when its key is already queued
    pub fn enqueue(&self, task: QueueTask) -> Result<bool, QueueError> {
        let key = task.key();
        let path = self.task_path(&key);
        if path.exists() {
            debug!("Task {} already queued", key);
            return Ok(false);
        }

        let stored = StoredTask {
            task,
            enqueued_at: Utc::now(),
        };
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        let file = File::create(&tmp).map_err(io_error(&tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &stored).map_err(|source| QueueError::Encode {
            key: key.clone(),
            source,
        })?;
        writer.flush().map_err(io_error(&tmp))?;
        writer.get_ref().sync_all().map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        sync_dir(&self.dir);

        debug!("Enqueued task {}", key);
        self.notify.notify_one();
        Ok(true)
    }

    /// Every queued task, oldest first
    pub fn pending(&self) -> Result<Vec<QueueTask>, QueueError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let path = entry.map_err(io_error(&self.dir))?.path();
            if !path.extension().map(|e| e == "json").unwrap_or(false) {
                continue;
            }
            match load_task(&path) {
                Ok(stored) => tasks.push(stored),
                Err(e) => warn!("Skipping unreadable task {}: {}", path.display(), e),
            }
        }

        tasks.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.task.key().cmp(&b.task.key()))
        });
        Ok(tasks.into_iter().map(|s| s.task).collect())
    }

    /// Whether a task with this key is still queued
    pub fn contains(&self, key: &str) -> bool {
        self.task_path(key).exists()
    }

    /// Remove a processed task
    pub fn ack(&self, key: &str) -> Result<(), QueueError> {
        let path = self.task_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending()?.len())
    }

    /// Wait until a task is enqueued or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

fn load_task(path: &Path) -> anyhow::Result<StoredTask> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Persist directory entries; not every platform supports opening a directory
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
