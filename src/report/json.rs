//! JSON file reporter.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info};

use super::{Reporter, TestResult, TestStatus};

/// Writes the full result list as a JSON document, for machine consumers.
pub struct JsonReporter {
    output_path: PathBuf,
    results: Mutex<Vec<TestResult>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document<'a> {
    passed: bool,
    suites: &'a [TestResult],
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            results: Mutex::new(Vec::new()),
        }
    }
}

impl Reporter for JsonReporter {
    fn add(&self, result: &TestResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    fn render(&self) {
        let results = self.results.lock().unwrap();
        let document = Document {
            passed: !results.iter().any(|r| r.status.is_failure()),
            suites: &results[..],
        };

        let body = match serde_json::to_string_pretty(&document) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "failed to serialize json report");
                return;
            }
        };

        if let Some(parent) = self.output_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(&self.output_path, body) {
            Ok(()) => info!(path = %self.output_path.display(), "json report written"),
            Err(err) => error!(error = %err, "failed to write json report"),
        }
    }
}
