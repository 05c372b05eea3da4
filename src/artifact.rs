//! Artifact download policy and the downloader contract.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{ArtifactDownload, When};

/// Fetches job artifacts into a local directory.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    /// Downloads the artifacts of `job_id` matching `patterns` into `dest`
    /// and returns the paths written.
    async fn download(
        &self,
        job_id: &str,
        dest: &Path,
        patterns: &[String],
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// Decides whether artifacts should be fetched for a finished attempt.
///
/// Pure: no network, no filesystem. A missing job ID (the start call never
/// succeeded), a timed-out attempt, or an async run always suppresses the
/// download; otherwise the configured condition applies.
pub fn should_download(
    job_id: &str,
    passed: bool,
    timed_out: bool,
    async_mode: bool,
    cfg: &ArtifactDownload,
) -> bool {
    if job_id.is_empty() || timed_out || async_mode {
        return false;
    }

    match cfg.when {
        When::Always => true,
        When::Never => false,
        When::Pass => passed,
        When::Fail => !passed,
    }
}

/// Destination directory for one suite's artifacts.
///
/// Suite names may contain path separators (shard names embed file paths),
/// so the name is flattened before joining.
pub fn suite_directory(cfg: &ArtifactDownload, suite_name: &str) -> PathBuf {
    let safe: String = suite_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    cfg.directory.join(safe)
}
