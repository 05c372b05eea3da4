//! Project bundling and remote storage upload.
//!
//! Cloud backends run suites against an uploaded project bundle. The
//! bundle is a tar archive of the project root minus ignore patterns;
//! uploads are skipped when the reference is already a `storage:` ID or
//! when the same file was uploaded before.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use tracing::{info, warn};

/// Archives containing more files than this warn about slow unpacking.
const ARCHIVE_FILE_COUNT_SOFT_LIMIT: usize = 32_768;

/// A stored bundle, addressable as `storage:<id>`.
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub id: String,
    pub name: String,
}

/// Uploads project bundles to remote storage.
#[async_trait]
pub trait ProjectUploader: Send + Sync {
    async fn upload(&self, path: &Path) -> anyhow::Result<StorageItem>;

    /// Looks up a previous upload of the same content. An empty ID means
    /// no match.
    async fn find(&self, path: &Path) -> anyhow::Result<StorageItem>;
}

/// Whether `value` already references remote storage.
pub fn is_storage_reference(value: &str) -> bool {
    value.starts_with("storage:")
}

/// Archives `project_dir` into `<dest_dir>/bundle.tar`, skipping paths that
/// match any of `ignore`.
pub fn archive_project(
    project_dir: &Path,
    dest_dir: &Path,
    ignore: &[String],
) -> anyhow::Result<PathBuf> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ignore {
        builder.add(Glob::new(pattern).with_context(|| format!("bad ignore pattern '{pattern}'"))?);
    }
    let ignore = builder.build()?;

    let start = Instant::now();
    let bundle = dest_dir.join("bundle.tar");
    let file = std::fs::File::create(&bundle)
        .with_context(|| format!("failed to create {}", bundle.display()))?;
    let mut archive = tar::Builder::new(file);

    let mut count = 0usize;
    add_dir(&mut archive, project_dir, project_dir, &ignore, &mut count)?;
    archive.finish()?;

    let size = std::fs::metadata(&bundle).map(|m| m.len()).unwrap_or(0);
    info!(
        duration_ms = start.elapsed().as_millis() as u64,
        size,
        file_count = count,
        "project archived"
    );
    if count >= ARCHIVE_FILE_COUNT_SOFT_LIMIT {
        warn!(
            file_count = count,
            "the archive is unusually large and will slow down job startup; \
             consider adding ignore patterns"
        );
    }

    Ok(bundle)
}

fn add_dir(
    archive: &mut tar::Builder<std::fs::File>,
    root: &Path,
    dir: &Path,
    ignore: &globset::GlobSet,
    count: &mut usize,
) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        if ignore.is_match(rel) {
            continue;
        }
        if path.is_dir() {
            add_dir(archive, root, &path, ignore, count)?;
        } else {
            archive.append_path_with_name(&path, rel)?;
            *count += 1;
        }
    }
    Ok(())
}

/// Resolves `app` to a storage reference, uploading the bundle if needed.
///
/// Passing an existing `storage:` reference is a no-op; a previously
/// uploaded identical file is reused without a new upload.
pub async fn upload_project(uploader: &dyn ProjectUploader, app: &str) -> anyhow::Result<String> {
    if is_storage_reference(app) {
        return Ok(app.to_string());
    }

    let path = Path::new(app);
    if let Ok(item) = uploader.find(path).await
        && !item.id.is_empty()
    {
        info!(storage_id = %item.id, "skipping upload, bundle already stored");
        return Ok(format!("storage:{}", item.id));
    }

    info!(file = %path.display(), "uploading project");
    let start = Instant::now();
    let item = uploader.upload(path).await?;
    info!(
        duration_ms = start.elapsed().as_millis() as u64,
        storage_id = %item.id,
        "project uploaded"
    );

    Ok(format!("storage:{}", item.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubUploader {
        known: Option<&'static str>,
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl ProjectUploader for StubUploader {
        async fn upload(&self, path: &Path) -> anyhow::Result<StorageItem> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(StorageItem {
                id: "fresh123".to_string(),
                name: path.display().to_string(),
            })
        }

        async fn find(&self, _path: &Path) -> anyhow::Result<StorageItem> {
            Ok(StorageItem {
                id: self.known.unwrap_or("").to_string(),
                name: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn storage_references_pass_through() {
        let uploader = StubUploader {
            known: None,
            uploads: AtomicUsize::new(0),
        };
        let got = upload_project(&uploader, "storage:abc").await.unwrap();
        assert_eq!(got, "storage:abc");
        assert_eq!(uploader.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn known_bundles_are_reused() {
        let uploader = StubUploader {
            known: Some("cached42"),
            uploads: AtomicUsize::new(0),
        };
        let got = upload_project(&uploader, "bundle.tar").await.unwrap();
        assert_eq!(got, "storage:cached42");
        assert_eq!(uploader.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_bundles_are_uploaded() {
        let uploader = StubUploader {
            known: None,
            uploads: AtomicUsize::new(0),
        };
        let got = upload_project(&uploader, "bundle.tar").await.unwrap();
        assert_eq!(got, "storage:fresh123");
        assert_eq!(uploader.uploads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn archive_skips_ignored_paths() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/dep")).unwrap();
        std::fs::write(src.path().join("node_modules/dep/index.js"), "x").unwrap();
        std::fs::write(src.path().join("spec.cy.js"), "x").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let bundle = archive_project(
            src.path(),
            dest.path(),
            &["node_modules/**".to_string()],
        )
        .unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(bundle).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["spec.cy.js".to_string()]);
    }
}
