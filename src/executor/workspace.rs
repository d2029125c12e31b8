//! Per-job workspace directories

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::ShardJob;

/// Checkout location inside a workspace
pub const REPO_DIR: &str = "repo";

/// Archive staging location inside a workspace
pub const STAGING_DIR: &str = "artifacts";

/// Directory of one job under `root`
pub fn workspace_path(root: &Path, job: &ShardJob) -> PathBuf {
    root.join(format!("run_{}_shard_{}", job.run_id, job.shard_index))
}

/// A job workspace, removed when dropped
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace, discarding leftovers of an earlier attempt
    pub fn acquire(root: &Path, job: &ShardJob) -> io::Result<Self> {
        let path = workspace_path(root, job);
        if path.exists() {
            warn!("Removing stale workspace {}", path.display());
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        debug!("Acquired workspace {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Released workspace {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job() -> ShardJob {
        ShardJob {
            run_id: 7,
            shard_index: 1,
            shard_total: 2,
        }
    }

    #[test]
    fn test_workspace_layout() {
        let path = workspace_path(Path::new("/work"), &job());
        assert_eq!(path, PathBuf::from("/work/run_7_shard_1"));
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let path = {
            let workspace = Workspace::acquire(root.path(), &job()).unwrap();
            std::fs::write(workspace.path().join("file.txt"), "x").unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_workspace_replaced() {
        let root = TempDir::new().unwrap();
        let stale = workspace_path(root.path(), &job());
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover"), "old").unwrap();

        let workspace = Workspace::acquire(root.path(), &job()).unwrap();
        assert!(!workspace.path().join("leftover").exists());
    }
}
