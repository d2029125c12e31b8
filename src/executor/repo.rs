//! Repository checkout

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::job::JobError;
use crate::models::RepoAuthMethod;

/// Where and how to fetch the code under test
#[derive(Clone, Debug, PartialEq)]
pub struct RepoSource {
    pub url: String,
    pub auth: RepoAuthMethod,
    pub token: Option<String>,
    pub ssh_key_path: Option<String>,
    pub branch: String,
    pub commit: String,
}

impl RepoSource {
    /// Clone URL with the token embedded for https access
    pub fn clone_url(&self) -> String {
        match (&self.auth, &self.token) {
            (RepoAuthMethod::Token, Some(token)) if !token.is_empty() => {
                match self.url.strip_prefix("https://") {
                    Some(rest) => format!("https://{token}@{rest}"),
                    None => self.url.clone(),
                }
            }
            _ => self.url.clone(),
        }
    }

    /// Replace the token wherever it appears in `text`
    pub fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    /// Whether a branch other than the remote default was requested
    pub fn names_branch(&self) -> bool {
        !self.branch.is_empty() && self.branch != "HEAD"
    }

    /// Whether a specific commit must be checked out after cloning
    pub fn pins_commit(&self) -> bool {
        !self.commit.is_empty() && self.commit != "HEAD"
    }

    fn ssh_command(&self) -> Option<String> {
        if self.auth != RepoAuthMethod::Ssh {
            return None;
        }
        self.ssh_key_path.as_ref().map(|key| {
            format!("ssh -i {key} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new")
        })
    }
}

/// Fetches a repository into a directory
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, source: &RepoSource, dest: &Path) -> Result<(), JobError>;
}

/// Fetches with the `git` command line
#[derive(Clone, Debug)]
pub struct GitFetcher {
    program: String,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitFetcher {
    async fn git(
        &self,
        source: &RepoSource,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh) = source.ssh_command() {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let shown = source.redact(&args.join(" "));
        debug!("Running git {}", shown);
        let output = cmd
            .output()
            .await
            .map_err(|e| JobError::Clone(format!("Failed to run git: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(JobError::Clone(format!(
                "git {} exited with {}: {}",
                shown,
                output.status.code().unwrap_or(-1),
                source.redact(stderr.trim())
            )))
        }
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, source: &RepoSource, dest: &Path) -> Result<(), JobError> {
        if source.url.trim().is_empty() {
            return Err(JobError::Clone("repository URL is empty".to_string()));
        }
        info!(
            "Cloning {} ({} @ {})",
            source.redact(&source.url),
            source.branch,
            source.commit
        );

        let url = source.clone_url();
        let dest_str = dest.to_string_lossy();
        let mut args = vec!["clone"];
        if source.names_branch() {
            args.extend(["--branch", source.branch.as_str()]);
        }
        if !source.pins_commit() {
            args.extend(["--depth", "1"]);
        }
        args.extend([url.as_str(), &*dest_str]);
        self.git(source, &args, None).await?;

        if source.pins_commit() {
            self.git(
                source,
                &["checkout", "--detach", source.commit.as_str()],
                Some(dest),
            )
            .await?;
            info!("Checked out commit {}", source.commit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(auth: RepoAuthMethod, token: Option<&str>) -> RepoSource {
        RepoSource {
            url: "https://git.example.com/shop/tests.git".to_string(),
            auth,
            token: token.map(str::to_string),
            ssh_key_path: Some("/keys/id_ed25519".to_string()),
            branch: "main".to_string(),
            commit: "HEAD".to_string(),
        }
    }

    #[test]
    fn test_token_injected_into_https_url() {
        let src = source(RepoAuthMethod::Token, Some("s3cr3t"));
        let url = src.clone_url();
        assert_eq!(url, "https://s3cr3t@git.example.com/shop/tests.git");
        assert_eq!(src.redact(&url), "https://***@git.example.com/shop/tests.git");
    }

    #[test]
    fn test_url_untouched_without_token() {
        let src = source(RepoAuthMethod::Token, None);
        assert_eq!(src.clone_url(), src.url);
        assert!(src.ssh_command().is_none());
    }

    #[test]
    fn test_ssh_auth_uses_key() {
        let mut src = source(RepoAuthMethod::Ssh, Some("ignored"));
        src.url = "git@git.example.com:shop/tests.git".to_string();
        assert_eq!(src.clone_url(), src.url);
        assert!(src.ssh_command().unwrap().contains("-i /keys/id_ed25519"));
    }

    #[test]
    fn test_commit_pinning() {
        let mut src = source(RepoAuthMethod::Token, None);
        assert!(!src.pins_commit());
        src.commit = "a1b2c3d".to_string();
        assert!(src.pins_commit());
    }

    #[test]
    fn test_head_branch_means_remote_default() {
        let mut src = source(RepoAuthMethod::Token, None);
        assert!(src.names_branch());
        src.branch = "HEAD".to_string();
        assert!(!src.names_branch());
        src.branch = String::new();
        assert!(!src.names_branch());
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=shardrun", "-c", "user.email=ci@shardrun.test"])
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    #[tokio::test]
    async fn test_clone_without_branch_follows_remote_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        std::fs::write(origin.join("conftest.py"), "").unwrap();
        git(&origin, &["add", "."]);
        git(&origin, &["commit", "-q", "-m", "init"]);

        let mut src = source(RepoAuthMethod::Token, None);
        src.url = origin.to_string_lossy().into_owned();
        src.branch = "HEAD".to_string();

        let dest = dir.path().join("repo");
        GitFetcher::default().fetch(&src, &dest).await.unwrap();
        assert!(dest.join("conftest.py").is_file());

        src.branch = "main".to_string();
        let err = GitFetcher::default()
            .fetch(&src, &dir.path().join("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Clone(_)));
    }

    #[tokio::test]
    async fn test_empty_url_is_clone_error() {
        let mut src = source(RepoAuthMethod::Token, None);
        src.url = String::new();
        let dir = tempfile::TempDir::new().unwrap();
        let err = GitFetcher::default()
            .fetch(&src, &dir.path().join("repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Clone(_)));
    }
}
