//! Dataset gate
//!
//! Decides whether a run may be created based on the health of the dataset
//! linked to its environment.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Catalog, DatasetVersion, HealthStatus, NewRun, ValidationStatus};

/// Outcome of validating a dataset version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateVerdict {
    pub is_valid: bool,
    pub detail: Option<String>,
}

impl GateVerdict {
    pub fn pass() -> Self {
        Self {
            is_valid: true,
            detail: None,
        }
    }

    pub fn reject(detail: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            detail: Some(detail.into()),
        }
    }
}

/// Gate errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Unknown suite {0}")]
    UnknownSuite(u64),

    #[error("Unknown environment {0}")]
    UnknownEnvironment(u64),

    #[error("Dataset validation failed for version {version}: {detail}")]
    Rejected { version: String, detail: String },
}

/// Validation engine selectable by configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Health,
    None,
}

impl EngineKind {
    pub fn parse(s: &str) -> Option<EngineKind> {
        match s.to_lowercase().as_str() {
            "health" => Some(EngineKind::Health),
            "none" | "off" => Some(EngineKind::None),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Health => f.write_str("health"),
            EngineKind::None => f.write_str("none"),
        }
    }
}

/// Validation engine seam
pub trait ValidationEngine: Send + Sync {
    fn validate(&self, version: &DatasetVersion) -> GateVerdict;
}

/// Judges a version by its recorded health, validation state and expectations
#[derive(Debug, Default)]
pub struct HealthEngine;

impl ValidationEngine for HealthEngine {
    fn validate(&self, version: &DatasetVersion) -> GateVerdict {
        if version.health_status == HealthStatus::Unhealthy {
            return GateVerdict::reject(format!("dataset version {} is unhealthy", version.version));
        }
        if version.validation_status == ValidationStatus::Failed {
            return GateVerdict::reject(format!(
                "dataset version {} failed validation",
                version.version
            ));
        }
        if let Some(expectations) = &version.expectations {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(expectations) {
                return GateVerdict::reject(format!("invalid expectations document: {e}"));
            }
        }
        GateVerdict::pass()
    }
}

/// Build the engine named in configuration
pub fn engine_for(kind: EngineKind) -> Option<Arc<dyn ValidationEngine>> {
    match kind {
        EngineKind::Health => Some(Arc::new(HealthEngine)),
        EngineKind::None => None,
    }
}

pub struct DatasetGate {
    catalog: Arc<Catalog>,
    engine: Option<Arc<dyn ValidationEngine>>,
}

impl DatasetGate {
    pub fn new(catalog: Arc<Catalog>, engine: Option<Arc<dyn ValidationEngine>>) -> Self {
        Self { catalog, engine }
    }

    /// Validate one dataset version by id
    pub fn validate(&self, version_id: u64) -> GateVerdict {
        let Some(engine) = &self.engine else {
            debug!("No validation engine configured, passing version {}", version_id);
            return GateVerdict::pass();
        };
        match self.catalog.dataset_version(version_id) {
            Some(version) => engine.validate(version),
            None => GateVerdict::reject(format!("dataset version {version_id} not found")),
        }
    }

    /// Check whether a run may be created.
    ///
    /// Returns the dataset version the run will record, if any.
    pub fn check_run(&self, request: &NewRun) -> Result<Option<DatasetVersion>, GateError> {
        let suite = self
            .catalog
            .suite(request.suite_id)
            .ok_or(GateError::UnknownSuite(request.suite_id))?;
        let environment = self
            .catalog
            .environment(request.environment_id)
            .ok_or(GateError::UnknownEnvironment(request.environment_id))?;

        let latest = environment
            .dataset_id
            .and_then(|id| self.catalog.latest_version(id))
            .cloned();

        if !suite.require_dataset_health {
            return Ok(latest);
        }
        let Some(version) = latest else {
            return Ok(None);
        };

        let verdict = self.validate(version.id);
        if !verdict.is_valid {
            let detail = verdict
                .detail
                .unwrap_or_else(|| "validation failed".to_string());
            info!(
                "Dataset gate rejected suite {} on {}: {}",
                suite.name, environment.name, detail
            );
            return Err(GateError::Rejected {
                version: version.version,
                detail,
            });
        }

        debug!("Dataset version {} passed the gate", version.version);
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dataset, Environment, Suite};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        calls: AtomicUsize,
    }

    impl ValidationEngine for CountingEngine {
        fn validate(&self, _version: &DatasetVersion) -> GateVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GateVerdict::reject("always")
        }
    }

    fn version(id: u64, ts: i64, health: HealthStatus) -> DatasetVersion {
        DatasetVersion {
            id,
            dataset_id: 1,
            version: format!("v{id}"),
            health_status: health,
            validation_status: ValidationStatus::Pending,
            expectations: None,
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    fn catalog(require: bool, versions: Vec<DatasetVersion>) -> Arc<Catalog> {
        Arc::new(Catalog {
            suites: vec![Suite {
                id: 1,
                project_id: 1,
                name: "smoke".to_string(),
                layer: Default::default(),
                tags: vec![],
                shards: None,
                retries: 0,
                timeout: None,
                require_dataset_health: require,
            }],
            environments: vec![Environment {
                id: 1,
                project_id: 1,
                name: "staging".to_string(),
                base_url: None,
                api_url: None,
                dataset_id: Some(1),
            }],
            datasets: vec![Dataset {
                id: 1,
                name: "users".to_string(),
                versions,
            }],
            ..Default::default()
        })
    }

    fn request() -> NewRun {
        NewRun {
            project_id: 1,
            suite_id: 1,
            environment_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_bypass_never_invokes_engine() {
        let engine = Arc::new(CountingEngine {
            calls: AtomicUsize::new(0),
        });
        let gate = DatasetGate::new(
            catalog(false, vec![version(1, 10, HealthStatus::Unhealthy)]),
            Some(engine.clone() as Arc<dyn ValidationEngine>),
        );
        let selected = gate.check_run(&request()).unwrap();
        assert_eq!(selected.map(|v| v.id), Some(1));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_latest_unhealthy_rejects() {
        let gate = DatasetGate::new(
            catalog(
                true,
                vec![
                    version(1, 10, HealthStatus::Healthy),
                    version(2, 20, HealthStatus::Unhealthy),
                ],
            ),
            engine_for(EngineKind::Health),
        );
        let err = gate.check_run(&request()).unwrap_err();
        assert!(matches!(err, GateError::Rejected { ref version, .. } if version == "v2"));
    }

    #[test]
    fn test_older_unhealthy_is_ignored() {
        let gate = DatasetGate::new(
            catalog(
                true,
                vec![
                    version(1, 10, HealthStatus::Unhealthy),
                    version(2, 20, HealthStatus::Unknown),
                ],
            ),
            engine_for(EngineKind::Health),
        );
        assert_eq!(gate.check_run(&request()).unwrap().map(|v| v.id), Some(2));
    }

    #[test]
    fn test_missing_engine_passes() {
        let gate = DatasetGate::new(
            catalog(true, vec![version(1, 10, HealthStatus::Unhealthy)]),
            engine_for(EngineKind::None),
        );
        assert!(gate.check_run(&request()).is_ok());
    }

    #[test]
    fn test_no_versions_passes() {
        let gate = DatasetGate::new(catalog(true, vec![]), engine_for(EngineKind::Health));
        assert!(gate.check_run(&request()).unwrap().is_none());
    }

    #[test]
    fn test_validate_unknown_version() {
        let gate = DatasetGate::new(catalog(true, vec![]), engine_for(EngineKind::Health));
        let verdict = gate.validate(99);
        assert!(!verdict.is_valid);
        assert_eq!(verdict.detail.as_deref(), Some("dataset version 99 not found"));
    }

    #[test]
    fn test_health_engine_expectations() {
        let mut v = version(1, 10, HealthStatus::Healthy);
        v.expectations = Some(r#"{"min_rows": 10}"#.to_string());
        assert!(HealthEngine.validate(&v).is_valid);

        v.expectations = Some("{broken".to_string());
        assert!(!HealthEngine.validate(&v).is_valid);

        v.expectations = None;
        v.validation_status = ValidationStatus::Failed;
        assert!(!HealthEngine.validate(&v).is_valid);
    }

    #[test]
    fn test_unknown_suite() {
        let gate = DatasetGate::new(catalog(true, vec![]), None);
        let mut req = request();
        req.suite_id = 5;
        assert_eq!(gate.check_run(&req).unwrap_err(), GateError::UnknownSuite(5));
    }
}
