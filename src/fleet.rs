//! Legacy fleet sequencing: pull-based test file assignment for
//! horizontally distributed workers.
//!
//! A fleet is registered once per build with the concrete test files of
//! each suite; workers (possibly in separate CI shards) then pull one file
//! at a time via [`Sequencer::next_assignment`] until the per-suite queue
//! is drained. Delivery is at-most-once: no file is handed out twice, even
//! under concurrent pulls.
//!
//! This path predates per-suite sharding ([`crate::shard`]) and is kept for
//! distributed setups where a shared assignment source is required. The
//! [`Sequencer`] trait permits a network-backed implementation;
//! [`MemorySequencer`] is the in-process reference.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

/// One suite's worth of registered test files.
#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    pub test_files: Vec<String>,
}

/// Legacy suite selector: a name plus a regex matched against file paths.
#[derive(Debug, Clone)]
pub struct SuitePattern {
    pub name: String,
    pub match_pattern: String,
}

/// Hands out test file assignments for registered fleets.
#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Registers the fleet and returns its ID.
    async fn register(&self, build_id: &str, suites: Vec<TestSuite>) -> anyhow::Result<String>;

    /// Pops the next file for `(fleet_id, suite_name)`. `None` signals that
    /// no assignments are left and the caller should stop requesting work
    /// for that suite.
    async fn next_assignment(
        &self,
        fleet_id: &str,
        suite_name: &str,
    ) -> anyhow::Result<Option<String>>;
}

/// In-process sequencer backed by per-key FIFO queues.
#[derive(Default)]
pub struct MemorySequencer {
    sequence: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sequencer for MemorySequencer {
    async fn register(&self, build_id: &str, suites: Vec<TestSuite>) -> anyhow::Result<String> {
        let mut sequence = self.sequence.lock().expect("sequencer lock poisoned");
        for suite in suites {
            let key = format!("{}{}", build_id, suite.name);
            sequence.insert(key, suite.test_files.into());
        }

        // The build ID doubles as the fleet ID.
        Ok(build_id.to_string())
    }

    async fn next_assignment(
        &self,
        fleet_id: &str,
        suite_name: &str,
    ) -> anyhow::Result<Option<String>> {
        let mut sequence = self.sequence.lock().expect("sequencer lock poisoned");
        Ok(sequence
            .get_mut(&format!("{}{}", fleet_id, suite_name))
            .and_then(VecDeque::pop_front))
    }
}

/// Enumerates test files under `roots`, matches them against each suite's
/// pattern, and registers the resulting fleet with `seq`.
///
/// An empty `build_id` gets a generated one.
pub async fn register(
    seq: &dyn Sequencer,
    build_id: &str,
    roots: &[PathBuf],
    suites: &[SuitePattern],
) -> anyhow::Result<String> {
    let build_id = if build_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        build_id.to_string()
    };

    let mut files = Vec::new();
    for root in roots {
        collect_files(root, &mut files)?;
    }
    files.sort();

    let mut registered = Vec::with_capacity(suites.len());
    for suite in suites {
        let pattern = Regex::new(&suite.match_pattern)?;
        let test_files: Vec<String> = files
            .iter()
            .filter(|f| pattern.is_match(f))
            .cloned()
            .collect();

        debug!(
            suite = %suite.name,
            files = test_files.len(),
            "registering fleet suite"
        );
        registered.push(TestSuite {
            name: suite.name.clone(),
            test_files,
        });
    }

    seq.register(&build_id, registered).await
}

fn collect_files(dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path.to_string_lossy().to_string());
        }
    }
    Ok(())
}
