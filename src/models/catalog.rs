//! Catalog models
//!
//! Projects, suites, environments and datasets are managed elsewhere; the
//! coordinator only reads them from a catalog document loaded at start.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Test layer of a suite
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Unit,
    Contract,
    Integration,
    #[default]
    E2e,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Unit => "unit",
            Layer::Contract => "contract",
            Layer::Integration => "integration",
            Layer::E2e => "e2e",
        }
    }

    pub fn parse(s: &str) -> Option<Layer> {
        match s.to_lowercase().as_str() {
            "unit" => Some(Layer::Unit),
            "contract" => Some(Layer::Contract),
            "integration" => Some(Layer::Integration),
            "e2e" | "end-to-end" => Some(Layer::E2e),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executor authenticates against the repository
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAuthMethod {
    #[default]
    Token,
    Ssh,
}

impl RepoAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoAuthMethod::Token => "token",
            RepoAuthMethod::Ssh => "ssh",
        }
    }

    pub fn parse(s: &str) -> Option<RepoAuthMethod> {
        match s.to_lowercase().as_str() {
            "token" | "https" => Some(RepoAuthMethod::Token),
            "ssh" | "key" => Some(RepoAuthMethod::Ssh),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub repo_auth_method: RepoAuthMethod,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Named test selection plus execution policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Suite {
    pub id: u64,
    pub project_id: u64,
    pub name: String,
    #[serde(default)]
    pub layer: Layer,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parallelism; unresolved or zero means one shard
    #[serde(default)]
    pub shards: Option<u32>,
    /// Per-test retry budget handed to the runner
    #[serde(default)]
    pub retries: u32,
    /// Execution timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub require_dataset_health: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub id: u64,
    pub project_id: u64,
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Passed,
    Failed,
    #[default]
    Pending,
}

/// Immutable snapshot of a dataset
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub id: u64,
    pub dataset_id: u64,
    pub version: String,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub validation_status: ValidationStatus,
    /// JSON expectation document
    #[serde(default)]
    pub expectations: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub versions: Vec<DatasetVersion>,
}

/// Read-only view of the entities a run refers to
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub suites: Vec<Suite>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

impl Catalog {
    /// Load a catalog from a YAML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);

        let catalog: Self = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML catalog: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON catalog: {}", path.display()))?
        };

        Ok(catalog)
    }

    pub fn project(&self, id: u64) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn suite(&self, id: u64) -> Option<&Suite> {
        self.suites.iter().find(|s| s.id == id)
    }

    pub fn environment(&self, id: u64) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == id)
    }

    pub fn dataset(&self, id: u64) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.id == id)
    }

    pub fn dataset_version(&self, id: u64) -> Option<&DatasetVersion> {
        self.datasets
            .iter()
            .flat_map(|d| d.versions.iter())
            .find(|v| v.id == id)
    }

    /// Most recently created version; on equal timestamps the higher id wins
    pub fn latest_version(&self, dataset_id: u64) -> Option<&DatasetVersion> {
        self.dataset(dataset_id)?
            .versions
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn version(id: u64, ts: i64) -> DatasetVersion {
        DatasetVersion {
            id,
            dataset_id: 1,
            version: format!("v{id}"),
            health_status: HealthStatus::Healthy,
            validation_status: ValidationStatus::Passed,
            expectations: None,
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn test_latest_version_by_time() {
        let catalog = Catalog {
            datasets: vec![Dataset {
                id: 1,
                name: "users".to_string(),
                versions: vec![version(1, 100), version(2, 300), version(3, 200)],
            }],
            ..Default::default()
        };
        assert_eq!(catalog.latest_version(1).map(|v| v.id), Some(2));
    }

    #[test]
    fn test_latest_version_tie_breaks_on_id() {
        let catalog = Catalog {
            datasets: vec![Dataset {
                id: 1,
                name: "users".to_string(),
                versions: vec![version(7, 100), version(4, 100)],
            }],
            ..Default::default()
        };
        assert_eq!(catalog.latest_version(1).map(|v| v.id), Some(7));
        assert!(catalog.latest_version(2).is_none());
    }

    #[test]
    fn test_load_yaml_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
projects:
  - id: 1
    name: shop
    repo_url: https://git.example.com/shop.git
suites:
  - id: 10
    project_id: 1
    name: smoke
    layer: integration
    shards: 2
environments:
  - id: 20
    project_id: 1
    name: staging
"#,
        )
        .unwrap();

        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.project(1).unwrap().repo_auth_method, RepoAuthMethod::Token);
        let suite = catalog.suite(10).unwrap();
        assert_eq!(suite.layer, Layer::Integration);
        assert_eq!(suite.shards, Some(2));
        assert!(!suite.require_dataset_health);
        assert_eq!(catalog.environment(20).unwrap().name, "staging");
    }

    #[test]
    fn test_layer_parse() {
        assert_eq!(Layer::parse("E2E"), Some(Layer::E2e));
        assert_eq!(Layer::parse("unit"), Some(Layer::Unit));
        assert_eq!(Layer::parse("smoke"), None);
    }
}
