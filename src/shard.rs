//! Suite sharding.
//!
//! Sharding expands one configured suite into N concrete suites before
//! scheduling. The expansion is deterministic for a given filesystem
//! snapshot: matched files are sorted before any split.
//!
//! Modes:
//! - `spec`: one shard per matched file, suite settings inherited, name
//!   suffixed with the file path.
//! - `concurrency`: matched files partitioned into one contiguous bucket
//!   per concurrency slot (see [`crate::concurrency::bin_pack`]).
//! - `none`: pass-through.
//!
//! A shard request that matches zero files is a configuration error and
//! fails the run before any suite is scheduled.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::concurrency::bin_pack;
use crate::config::{ShardMode, Suite};

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("invalid spec pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },

    #[error("suite '{0}' patterns have no matching files")]
    NoMatch(String),

    #[error("failed to scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Expands every suite in `suites` according to its shard mode.
///
/// `ccy` is the effective concurrency, used as the bucket count for
/// `concurrency` mode.
pub fn shard_suites(root: &Path, suites: &[Suite], ccy: usize) -> Result<Vec<Suite>, ShardError> {
    let mut sharded = Vec::with_capacity(suites.len());

    for suite in suites {
        if suite.shard == ShardMode::None {
            sharded.push(suite.clone());
            continue;
        }

        let files = matched_files(root, &suite.spec_pattern, &suite.exclude_spec_pattern)?;
        if files.is_empty() {
            return Err(ShardError::NoMatch(suite.name.clone()));
        }

        debug!(
            suite = %suite.name,
            files = files.len(),
            mode = ?suite.shard,
            "sharding suite"
        );
        sharded.extend(expand(suite, &files, ccy));
    }

    Ok(sharded)
}

/// Splits one suite over its matched files. Pure; `files` must be non-empty
/// and sorted.
fn expand(suite: &Suite, files: &[String], ccy: usize) -> Vec<Suite> {
    match suite.shard {
        ShardMode::None => vec![suite.clone()],
        ShardMode::Spec => files
            .iter()
            .map(|f| {
                let mut replica = suite.clone();
                replica.name = format!("{} - {}", suite.name, f);
                replica.spec_pattern = vec![f.clone()];
                replica
            })
            .collect(),
        ShardMode::Concurrency => {
            let groups = bin_pack(files, ccy);
            let total = groups.len();
            groups
                .into_iter()
                .enumerate()
                .map(|(i, group)| {
                    let mut replica = suite.clone();
                    replica.name = format!("{} - {}/{}", suite.name, i + 1, total);
                    replica.spec_pattern = group;
                    replica
                })
                .collect()
        }
    }
}

/// Returns the sorted, root-relative paths matching `patterns` minus
/// `excludes`.
pub fn matched_files(
    root: &Path,
    patterns: &[String],
    excludes: &[String],
) -> Result<Vec<String>, ShardError> {
    let include = build_globset(patterns)?;
    let exclude = build_globset(excludes)?;

    let mut files = Vec::new();
    collect_files(root, root, &mut files).map_err(|source| ShardError::Scan {
        path: root.to_path_buf(),
        source,
    })?;

    let mut matched: Vec<String> = files
        .into_iter()
        .filter(|f| include.is_match(f) && !exclude.is_match(f))
        .collect();
    matched.sort();
    Ok(matched)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ShardError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ShardError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ShardError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}
