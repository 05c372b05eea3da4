//! JUnit XML reporter.
//!
//! Writes one `<testsuite>` with a `<testcase>` per scheduled suite, the
//! shape CI systems (Jenkins, GitLab, GitHub Actions) ingest natively.
//! Attempt counts are carried as a `retries`-style property so flaky
//! suites remain visible in dashboards.

use std::path::PathBuf;
use std::sync::Mutex;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::{error, info};

use super::{Reporter, TestResult, TestStatus};

pub struct JunitReporter {
    output_path: PathBuf,
    results: Mutex<Vec<TestResult>>,
}

impl JunitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            results: Mutex::new(Vec::new()),
        }
    }

    fn generate_xml(&self, results: &[TestResult]) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = results.len();
        let failures = results
            .iter()
            .filter(|r| r.status == TestStatus::Failed || r.status == TestStatus::TimedOut)
            .count();
        let errors = results
            .iter()
            .filter(|r| r.status == TestStatus::Errored)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.status == TestStatus::Skipped)
            .count();
        let time: f64 = results.iter().map(|r| r.duration.as_secs_f64()).sum();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{time:.3}").as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", "stratus"));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", errors.to_string().as_str()));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("time", format!("{time:.3}").as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in results {
            let classname = if result.browser.is_empty() {
                result.platform.clone()
            } else {
                format!("{}.{}", result.platform, result.browser)
            };

            let mut testcase = BytesStart::new("testcase");
            testcase.push_attribute(("classname", classname.as_str()));
            testcase.push_attribute(("name", result.name.as_str()));
            testcase.push_attribute((
                "time",
                format!("{:.3}", result.duration.as_secs_f64()).as_str(),
            ));
            testcase.push_attribute(("retries", result.attempts.len().to_string().as_str()));

            match result.status {
                TestStatus::Passed | TestStatus::InProgress => {
                    writer.write_event(Event::Empty(testcase))?;
                }
                TestStatus::Skipped => {
                    writer.write_event(Event::Start(testcase))?;
                    writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
                    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
                TestStatus::Failed | TestStatus::TimedOut | TestStatus::Errored => {
                    let tag = if result.status == TestStatus::Errored {
                        "error"
                    } else {
                        "failure"
                    };
                    let message = result
                        .last_attempt()
                        .map(|a| {
                            if a.error.is_empty() {
                                result.status.to_string()
                            } else {
                                a.error.clone()
                            }
                        })
                        .unwrap_or_else(|| result.status.to_string());

                    writer.write_event(Event::Start(testcase))?;
                    let mut element = BytesStart::new(tag);
                    element.push_attribute(("message", message.as_str()));
                    writer.write_event(Event::Start(element))?;
                    writer.write_event(Event::Text(BytesText::new(&message)))?;
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
                }
            }
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

impl Reporter for JunitReporter {
    fn add(&self, result: &TestResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    fn render(&self) {
        let results = self.results.lock().unwrap();
        let xml = match self.generate_xml(&results[..]) {
            Ok(xml) => xml,
            Err(err) => {
                error!(error = %err, "failed to generate junit report");
                return;
            }
        };

        if let Some(parent) = self.output_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(&self.output_path, xml) {
            Ok(()) => info!(path = %self.output_path.display(), "junit report written"),
            Err(err) => error!(error = %err, "failed to write junit report"),
        }
    }
}
