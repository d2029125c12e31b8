//! Artifact retention sweep

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::aggregator::Aggregator;
use crate::models::Run;
use crate::storage::ArtifactStore;
use crate::store::RunFilter;

pub struct RetentionSweeper {
    aggregator: Aggregator,
    artifacts: Arc<dyn ArtifactStore>,
    days: i64,
}

impl RetentionSweeper {
    pub fn new(aggregator: Aggregator, artifacts: Arc<dyn ArtifactStore>, days: i64) -> Self {
        Self {
            aggregator,
            artifacts,
            days,
        }
    }

    /// Whether the run's artifacts are past retention at `now`
    pub fn is_expired(&self, run: &Run, now: DateTime<Utc>) -> bool {
        match run.completed_at {
            Some(completed) if run.status.is_terminal() && !run.artifacts.is_empty() => {
                completed + Duration::days(self.days) < now
            }
            _ => false,
        }
    }

    /// Delete expired artifacts and drop their references.
    ///
    /// A run keeps its references when any deletion fails so the next sweep
    /// retries it. Returns the number of purged runs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let runs = match self.aggregator.store().list(&RunFilter {
            limit: Some(usize::MAX),
            ..Default::default()
        }) {
            Ok(runs) => runs,
            Err(e) => {
                error!("Retention sweep could not list runs: {}", e);
                return 0;
            }
        };

        let mut purged = 0;
        for run in runs.iter().filter(|r| self.is_expired(r, now)) {
            let mut failed = 0;
            for artifact in &run.artifacts {
                if let Err(e) = self.artifacts.delete(&artifact.storage_key).await {
                    warn!("Run {}: {}", run.id, e);
                    failed += 1;
                }
            }
            if failed > 0 {
                warn!(
                    "Run {}: {} artifacts not deleted, keeping references",
                    run.id, failed
                );
                continue;
            }

            match self.aggregator.purge_artifacts(run.id, run.artifacts.len()) {
                Ok(_) => {
                    info!("Purged {} artifacts of run {}", run.artifacts.len(), run.id);
                    purged += 1;
                }
                Err(e) => error!("Failed to purge artifacts of run {}: {}", run.id, e),
            }
        }
        purged
    }

    /// Sweep every `period` until shutdown
    pub async fn run(self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period.max(std::time::Duration::from_secs(1)));
        info!("Retention sweep started, keeping artifacts {} days", self.days);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Retention sweep stopped");
    }
}
