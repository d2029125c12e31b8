//! Repository run configuration (`shardrun.yml`)
//!
//! ```yaml
//! test_dir: tests
//! install:
//!   - pip install -r requirements.txt
//!   - pip install -e .
//! runner_args: ["-p", "no:cacheprovider"]
//! environments:
//!   staging:
//!     BASE_URL: https://staging.example.com
//!     TIMEOUT: 30
//! ```

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::job::JobError;

/// Accepted file names, looked up in order at the repository root
pub const CONFIG_FILES: [&str; 2] = ["shardrun.yml", ".shardrun.yml"];

const DEFAULT_TEST_DIR: &str = "tests";

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Test directory relative to the repository root
    pub test_dir: Option<String>,

    /// Shell commands run before the tests; unset uses the default install
    pub install: Option<Vec<String>>,

    /// Extra arguments appended to the runner command line
    pub runner_args: Vec<String>,

    /// Variables exported per target environment name
    pub environments: BTreeMap<String, BTreeMap<String, Value>>,
}

impl RunConfig {
    /// Load the run configuration of a checked out repository
    pub fn load(repo: &Path) -> Result<Self, JobError> {
        let path = CONFIG_FILES
            .iter()
            .map(|name| repo.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                JobError::RunConfig(format!(
                    "none of {} found in repository",
                    CONFIG_FILES.join(", ")
                ))
            })?;
        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| JobError::RunConfig(format!("{}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .map_err(|e| JobError::RunConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn test_dir(&self, repo: &Path) -> PathBuf {
        repo.join(self.test_dir.as_deref().unwrap_or(DEFAULT_TEST_DIR))
    }

    /// Commands to run before the tests.
    ///
    /// Without an explicit list, requirements.txt is installed when present.
    pub fn install_commands(&self, repo: &Path) -> Vec<String> {
        match &self.install {
            Some(commands) => commands.clone(),
            None if repo.join("requirements.txt").is_file() => {
                vec!["pip install -r requirements.txt".to_string()]
            }
            None => Vec::new(),
        }
    }

    /// Variables to export for `environment`
    pub fn environment_vars(&self, environment: &str) -> Vec<(String, String)> {
        self.environments
            .get(environment)
            .map(|vars| {
                vars.iter()
                    .filter_map(|(name, value)| scalar(value).map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_full_config() {
        let repo = TempDir::new().unwrap();
        std::fs::write(
            repo.path().join("shardrun.yml"),
            r#"
test_dir: suites
install:
  - pip install -e .
runner_args: ["-x"]
environments:
  staging:
    BASE_URL: https://staging.example.com
    TIMEOUT: 30
    HEADLESS: true
"#,
        )
        .unwrap();

        let config = RunConfig::load(repo.path()).unwrap();
        assert_eq!(config.test_dir(repo.path()), repo.path().join("suites"));
        assert_eq!(config.install_commands(repo.path()), vec!["pip install -e ."]);
        assert_eq!(config.runner_args, vec!["-x"]);
        assert_eq!(
            config.environment_vars("staging"),
            vec![
                ("BASE_URL".to_string(), "https://staging.example.com".to_string()),
                ("HEADLESS".to_string(), "true".to_string()),
                ("TIMEOUT".to_string(), "30".to_string()),
            ]
        );
        assert!(config.environment_vars("production").is_empty());
    }

    #[test]
    fn test_hidden_file_and_default_install() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join(".shardrun.yml"), "").unwrap();
        let config = RunConfig::load(repo.path()).unwrap();
        assert!(config.install_commands(repo.path()).is_empty());
        assert_eq!(config.test_dir(repo.path()), repo.path().join("tests"));

        std::fs::write(repo.path().join("requirements.txt"), "requests\n").unwrap();
        assert_eq!(
            config.install_commands(repo.path()),
            vec!["pip install -r requirements.txt"]
        );
    }

    #[test]
    fn test_missing_config_is_error() {
        let repo = TempDir::new().unwrap();
        let err = RunConfig::load(repo.path()).unwrap_err();
        assert!(matches!(err, JobError::RunConfig(_)));
        assert!(err.to_string().contains("shardrun.yml"));
    }

    #[test]
    fn test_malformed_config_is_error() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("shardrun.yml"), "install: [unterminated").unwrap();
        assert!(matches!(
            RunConfig::load(repo.path()),
            Err(JobError::RunConfig(_))
        ));

        std::fs::write(repo.path().join("shardrun.yml"), "instal: []").unwrap();
        assert!(matches!(
            RunConfig::load(repo.path()),
            Err(JobError::RunConfig(_))
        ));
    }
}
