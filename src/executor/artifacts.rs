//! Artifact collection and upload
//!
//! Report directories are packed into zip archives in the staging directory
//! and uploaded under `runs/{run_id}/shard-{index}/{type}/{file}`.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::test_runner::ALLURE_RESULTS_DIR;
use crate::models::{ArtifactType, RunArtifact, ShardJob};
use crate::storage::{artifact_key, ArtifactStore};

const ZIP: &str = "application/zip";

/// Directories never searched for logs or videos
const SKIP_DIRS: [&str; 5] = [".git", ".venv", "venv", "node_modules", "__pycache__"];

const VIDEO_EXTENSIONS: [&str; 3] = ["webm", "mp4", "mkv"];

/// A file ready for upload
#[derive(Clone, Debug, PartialEq)]
pub struct CollectedArtifact {
    pub kind: ArtifactType,
    pub path: PathBuf,
    pub content_type: &'static str,
}

impl CollectedArtifact {
    fn new(kind: ArtifactType, path: PathBuf, content_type: &'static str) -> Self {
        Self {
            kind,
            path,
            content_type,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.kind.to_string())
    }
}

/// Gather the reports a test run left in `repo`.
///
/// A kind that fails to pack is logged and left out.
pub fn collect(repo: &Path, staging: &Path) -> Vec<CollectedArtifact> {
    if let Err(e) = std::fs::create_dir_all(staging) {
        warn!("Cannot create staging directory {}: {}", staging.display(), e);
        return Vec::new();
    }

    let mut collected = Vec::new();
    let mut pack = |kind: ArtifactType, root: &Path, files: Vec<PathBuf>, name: &str| {
        if files.is_empty() {
            return;
        }
        let dest = staging.join(name);
        match zip_files(root, &files, &dest) {
            Ok(()) => {
                debug!("Packed {} files into {}", files.len(), dest.display());
                collected.push(CollectedArtifact::new(kind, dest, ZIP));
            }
            Err(e) => warn!("Failed to pack {} artifacts: {:#}", kind, e),
        }
    };

    let allure = repo.join(ALLURE_RESULTS_DIR);
    pack(ArtifactType::Allure, &allure, files_under(&allure, |_| true), "allure-results.zip");

    let htmlcov = repo.join("htmlcov");
    pack(ArtifactType::Coverage, &htmlcov, files_under(&htmlcov, |_| true), "coverage-html.zip");

    let screenshots = [repo.join("screenshots"), repo.join("test-results/screenshots")]
        .into_iter()
        .map(|dir| {
            let files = files_under(&dir, |p| has_extension(p, &["png"]));
            (dir, files)
        })
        .find(|(_, files)| !files.is_empty());
    if let Some((dir, files)) = screenshots {
        pack(ArtifactType::Screenshot, &dir, files, "screenshots.zip");
    }

    pack(ArtifactType::Log, repo, files_under(repo, |p| has_extension(p, &["log"])), "logs.zip");

    let videos: Vec<PathBuf> = ["videos", "test-results"]
        .iter()
        .flat_map(|dir| files_under(&repo.join(dir), |p| has_extension(p, &VIDEO_EXTENSIONS)))
        .collect();
    pack(ArtifactType::Video, repo, videos, "videos.zip");

    let coverage_xml = repo.join("coverage.xml");
    if coverage_xml.is_file() {
        collected.push(CollectedArtifact::new(
            ArtifactType::Coverage,
            coverage_xml,
            "application/xml",
        ));
    }

    collected
}

fn skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && SKIP_DIRS
            .iter()
            .any(|d| entry.file_name().to_string_lossy() == *d)
}

fn files_under(root: &Path, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skipped_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && keep(e.path()))
        .map(|e| e.into_path())
        .collect()
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| *e == ext)
        })
        .unwrap_or(false)
}

/// Write `files` into a zip archive at `dest`, named relative to `root`
fn zip_files(root: &Path, files: &[PathBuf], dest: &Path) -> Result<()> {
    let file = File::create(dest)
        .with_context(|| format!("Failed to create archive: {}", dest.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        let name = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        zip.start_file(name, options)?;
        let mut source =
            File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Upload collected files, returning references to the stored ones.
///
/// A failed upload is logged and skipped.
pub async fn upload(
    store: &dyn ArtifactStore,
    job: &ShardJob,
    collected: &[CollectedArtifact],
) -> Vec<RunArtifact> {
    let mut uploaded = Vec::new();
    for artifact in collected {
        let key = artifact_key(
            job.run_id,
            job.shard_index,
            artifact.kind.as_str(),
            &artifact.file_name(),
        );
        match store.put(&key, &artifact.path, artifact.content_type).await {
            Ok(size_bytes) => {
                info!("Uploaded {} ({} bytes)", key, size_bytes);
                uploaded.push(RunArtifact {
                    run_id: job.run_id,
                    shard_index: Some(job.shard_index),
                    artifact_type: artifact.kind,
                    bucket: store.bucket().to_string(),
                    storage_key: key,
                    size_bytes,
                    mime_type: artifact.content_type.to_string(),
                    created_at: Utc::now(),
                });
            }
            Err(e) => warn!("Skipping artifact {}: {}", artifact.path.display(), e),
        }
    }
    uploaded
}
