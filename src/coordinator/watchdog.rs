//! Stalled run watchdog
//!
//! A run whose executors never report back would stay non-terminal forever.
//! The watchdog force-resolves dispatched runs once their deadline passes.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::aggregator::Aggregator;
use crate::config::WatchdogConfig;
use crate::models::{Catalog, Run, RunStatus, ShardStatus};

/// Upper bound on any deadline (one year)
const MAX_DEADLINE_SECS: i64 = 365 * 24 * 3600;

pub struct Watchdog {
    aggregator: Aggregator,
    catalog: Arc<Catalog>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(aggregator: Aggregator, catalog: Arc<Catalog>, config: WatchdogConfig) -> Self {
        Self {
            aggregator,
            catalog,
            config,
        }
    }

    /// Instant after which a dispatched run counts as stalled.
    ///
    /// Queued and terminal runs have no deadline.
    pub fn deadline(&self, run: &Run) -> Option<DateTime<Utc>> {
        if run.status == RunStatus::Queued || run.status.is_terminal() {
            return None;
        }
        let anchor = run.started_at.or(run.dispatched_at)?;
        let budget = self
            .catalog
            .suite(run.suite_id)
            .and_then(|s| s.timeout)
            .unwrap_or(self.config.default_deadline_secs);
        let secs = i64::try_from(budget.saturating_add(self.config.grace_secs))
            .unwrap_or(MAX_DEADLINE_SECS)
            .min(MAX_DEADLINE_SECS);
        anchor.checked_add_signed(Duration::seconds(secs))
    }

    /// Resolve every run past its deadline; returns the resolved runs
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Run> {
        let active = match self.aggregator.store().active() {
            Ok(runs) => runs,
            Err(e) => {
                error!("Watchdog could not list runs: {}", e);
                return Vec::new();
            }
        };

        let mut resolved = Vec::new();
        for run in active {
            let Some(deadline) = self.deadline(&run) else {
                continue;
            };
            if now <= deadline {
                continue;
            }

            let (missing_as, reason) = if run.started_at.is_some() {
                (
                    ShardStatus::TimedOut,
                    format!("no result before deadline {}", deadline.to_rfc3339()),
                )
            } else {
                (
                    ShardStatus::InfraFailed,
                    format!("no executor started before deadline {}", deadline.to_rfc3339()),
                )
            };

            match self.aggregator.force_resolve(run.id, missing_as, &reason) {
                Ok(run) => {
                    warn!("Watchdog resolved stalled run {} as {}", run.id, run.status);
                    resolved.push(run);
                }
                Err(e) => error!("Watchdog failed to resolve run {}: {}", run.id, e),
            }
        }
        resolved
    }

    /// Sweep every interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        info!("Watchdog started, sweeping every {:?}", period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let resolved = self.sweep(Utc::now());
                    debug!("Watchdog sweep resolved {} runs", resolved.len());
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::api::tests::catalog;
    use crate::coordinator::audit::tests::MemorySink;
    use crate::lifecycle::RunUpdate;
    use crate::models::NewRun;
    use crate::store::{MemoryRunStore, RunStore};

    fn setup() -> (Watchdog, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        let aggregator = Aggregator::new(store.clone(), Arc::new(MemorySink::default()));
        let watchdog = Watchdog::new(
            aggregator,
            Arc::new(catalog()),
            WatchdogConfig {
                enabled: true,
                interval_secs: 1,
                default_deadline_secs: 100,
                grace_secs: 10,
            },
        );
        (watchdog, store)
    }

    fn request(suite_id: u64) -> NewRun {
        NewRun {
            project_id: 1,
            suite_id,
            environment_id: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_queued_runs_are_never_swept() {
        let (watchdog, store) = setup();
        let run = store.insert(request(10), None).unwrap();
        assert!(watchdog.deadline(&run).is_none());
        assert!(watchdog.sweep(Utc::now() + Duration::days(30)).is_empty());
        assert_eq!(store.get(run.id).unwrap().status, RunStatus::Queued);
    }

    #[test]
    fn test_deadline_uses_suite_timeout() {
        let (watchdog, store) = setup();
        let run = store.insert(request(10), None).unwrap();
        let run = store
            .apply(run.id, RunUpdate::Dispatched { shard_total: 2 })
            .unwrap()
            .run;
        let anchor = run.dispatched_at.unwrap();
        // suite 10 has a 600s timeout
        assert_eq!(watchdog.deadline(&run), Some(anchor + Duration::seconds(610)));

        let other = store.insert(request(11), None).unwrap();
        let other = store
            .apply(other.id, RunUpdate::Dispatched { shard_total: 1 })
            .unwrap()
            .run;
        assert_eq!(
            watchdog.deadline(&other),
            Some(other.dispatched_at.unwrap() + Duration::seconds(110))
        );
    }

    #[test]
    fn test_never_started_run_is_infra_failed() {
        let (watchdog, store) = setup();
        let run = store.insert(request(10), None).unwrap();
        store
            .apply(run.id, RunUpdate::Dispatched { shard_total: 2 })
            .unwrap();

        assert!(watchdog.sweep(Utc::now()).is_empty());
        let resolved = watchdog.sweep(Utc::now() + Duration::seconds(611));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, RunStatus::InfraFailed);
        assert!(resolved[0].completed_at.is_some());
    }

    #[test]
    fn test_started_run_with_missing_shard_times_out() {
        let (watchdog, store) = setup();
        let run = store.insert(request(10), None).unwrap();
        store
            .apply(run.id, RunUpdate::Dispatched { shard_total: 2 })
            .unwrap();
        store
            .apply(
                run.id,
                RunUpdate::ShardStarted {
                    shard_index: 0,
                    shard_total: Some(2),
                },
            )
            .unwrap();

        let resolved = watchdog.sweep(Utc::now() + Duration::seconds(611));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, RunStatus::TimedOut);

        // Already terminal, nothing left to sweep
        assert!(watchdog.sweep(Utc::now() + Duration::days(1)).is_empty());
    }
}
