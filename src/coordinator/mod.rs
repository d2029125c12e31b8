//! Coordinator service
//!
//! Owns the run records. Hosts the public run API, the internal endpoints
//! used by the dispatcher and executors, the watchdog and the retention sweep.

mod aggregator;
mod api;
mod audit;
mod retention;
mod watchdog;

use aggregator::Aggregator;
use api::{router, CoordinatorState};
use audit::{AuditSink, JsonlAuditSink, TracingAuditSink};
use retention::RetentionSweeper;
use watchdog::Watchdog;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{expand_path, AppConfig};
use crate::gate::{engine_for, DatasetGate};
use crate::http::{Enqueuer, HttpEnqueuer, ServiceClient};
use crate::models::Catalog;
use crate::storage;
use crate::store::{FileRunStore, MemoryRunStore, RunStore};

/// Fully wired coordinator, ready to serve
pub struct CoordinatorService {
    state: CoordinatorState,
    watchdog: Option<Watchdog>,
    retention: Option<(RetentionSweeper, Duration)>,
}

impl CoordinatorService {
    /// Build from configuration.
    ///
    /// Without an explicit `enqueuer` triggers are forwarded to the
    /// configured dispatcher URL.
    pub async fn build(config: &AppConfig, enqueuer: Option<Arc<dyn Enqueuer>>) -> Result<Self> {
        let settings = &config.coordinator;

        let catalog = match &settings.catalog {
            Some(path) => Catalog::load(expand_path(path))?,
            None => {
                warn!("No catalog configured, run requests will be rejected");
                Catalog::default()
            }
        };
        let catalog = Arc::new(catalog);
        info!(
            "Catalog: {} projects, {} suites, {} environments, {} datasets",
            catalog.projects.len(),
            catalog.suites.len(),
            catalog.environments.len(),
            catalog.datasets.len()
        );

        let store: Arc<dyn RunStore> = match &settings.data_dir {
            Some(dir) => Arc::new(FileRunStore::open(expand_path(dir))?),
            None => {
                info!("No data directory configured, runs are kept in memory");
                Arc::new(MemoryRunStore::new())
            }
        };

        let audit: Arc<dyn AuditSink> = match &settings.audit_log {
            Some(path) => Arc::new(JsonlAuditSink::new(expand_path(path))?),
            None => Arc::new(TracingAuditSink),
        };

        let enqueuer = match enqueuer {
            Some(enqueuer) => enqueuer,
            None => {
                let client = ServiceClient::new(&settings.dispatcher_url, settings.request_timeout_secs)
                    .context("Failed to build dispatcher client")?
                    .with_secret(settings.internal_secret.as_deref())?;
                Arc::new(HttpEnqueuer::new(client)) as Arc<dyn Enqueuer>
            }
        };

        let aggregator = Aggregator::new(store, audit);
        let gate = Arc::new(DatasetGate::new(
            catalog.clone(),
            engine_for(config.gate.engine),
        ));

        let watchdog = config.watchdog.enabled.then(|| {
            Watchdog::new(aggregator.clone(), catalog.clone(), config.watchdog.clone())
        });

        let retention = if config.retention.enabled {
            let artifacts = storage::build(&config.storage).await;
            Some((
                RetentionSweeper::new(aggregator.clone(), artifacts, config.retention.days),
                Duration::from_secs(config.retention.interval_secs),
            ))
        } else {
            None
        };

        Ok(Self {
            state: CoordinatorState {
                aggregator,
                gate,
                catalog,
                enqueuer,
                internal_secret: settings.internal_secret.clone(),
            },
            watchdog,
            retention,
        })
    }

    #[cfg(test)]
    fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Serve until shutdown, running the background sweeps alongside
    pub async fn serve(self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(watchdog) = self.watchdog {
            tokio::spawn(watchdog.run(shutdown.clone()));
        }
        if let Some((sweeper, period)) = self.retention {
            tokio::spawn(sweeper.run(period, shutdown.clone()));
        }

        crate::api::serve(
            "Coordinator",
            listener,
            router(self.state),
            crate::api::wait_for_shutdown(shutdown),
        )
        .await
    }
}
