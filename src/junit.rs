//! JUnit XML parsing.
//!
//! Backends attach a `junit.xml` asset to finished jobs. The selective
//! retrier parses it to narrow the next attempt to the failed test cases,
//! and the console reporter summarizes it when no plain-text log exists.

use serde::Deserialize;

/// Asset name of a job's JUnit report.
pub const JUNIT_FILE_NAME: &str = "junit.xml";

/// The `<testsuites>` root element.
#[derive(Debug, Default, Deserialize)]
pub struct TestSuites {
    #[serde(rename = "testsuite", default)]
    pub suites: Vec<TestSuite>,
}

/// One `<testsuite>` element.
#[derive(Debug, Default, Deserialize)]
pub struct TestSuite {
    #[serde(rename = "@name", default)]
    pub name: String,

    #[serde(rename = "@package", default)]
    pub package: String,

    #[serde(rename = "@tests", default)]
    pub tests: usize,

    #[serde(rename = "@failures", default)]
    pub failures: usize,

    #[serde(rename = "@errors", default)]
    pub errors: usize,

    #[serde(rename = "testcase", default)]
    pub test_cases: Vec<TestCase>,
}

impl TestSuite {
    /// Tests that neither failed nor errored.
    pub fn passed(&self) -> usize {
        self.tests.saturating_sub(self.failures + self.errors)
    }
}

/// One `<testcase>` element.
#[derive(Debug, Default, Deserialize)]
pub struct TestCase {
    #[serde(rename = "@classname", default)]
    pub class_name: String,

    #[serde(rename = "@name", default)]
    pub name: String,

    pub failure: Option<Entry>,
    pub error: Option<Entry>,
}

impl TestCase {
    pub fn is_failing(&self) -> bool {
        self.failure.is_some() || self.error.is_some()
    }

    /// `classname.name`, or just `name` when no class is set.
    pub fn qualified_name(&self) -> String {
        if self.class_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.class_name, self.name)
        }
    }
}

/// Body of a `<failure>` or `<error>` element.
#[derive(Debug, Default, Deserialize)]
pub struct Entry {
    #[serde(rename = "@message", default)]
    pub message: String,

    #[serde(rename = "@type", default)]
    pub kind: String,

    #[serde(rename = "$text", default)]
    pub body: String,
}

impl TestSuites {
    /// Qualified names of all failing test cases, deduplicated in document
    /// order.
    pub fn failed_tests(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut failed = Vec::new();
        for suite in &self.suites {
            for case in suite.test_cases.iter().filter(|c| c.is_failing()) {
                let name = case.qualified_name();
                if seen.insert(name.clone()) {
                    failed.push(name);
                }
            }
        }
        failed
    }
}

/// Parses a JUnit document with either a `<testsuites>` or a bare
/// `<testsuite>` root. Some frameworks emit the latter.
pub fn parse(content: &[u8]) -> anyhow::Result<TestSuites> {
    let text = std::str::from_utf8(content)?;

    let parsed: TestSuites = quick_xml::de::from_str(text)?;
    if !parsed.suites.is_empty() {
        return Ok(parsed);
    }

    let single: TestSuite = quick_xml::de::from_str(text)?;
    Ok(TestSuites {
        suites: vec![single],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="login" package="e2e.login" tests="3" failures="1" errors="1">
    <testcase classname="e2e.login" name="accepts valid credentials" time="0.4"/>
    <testcase classname="e2e.login" name="rejects bad password" time="0.2">
      <failure message="expected error banner" type="AssertionError">banner not found</failure>
    </testcase>
    <testcase classname="e2e.login" name="locks after retries" time="0.1">
      <error message="page crashed" type="Error">renderer gone</error>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn parses_testsuites_root() {
        let report = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(report.suites.len(), 1);

        let suite = &report.suites[0];
        assert_eq!(suite.name, "login");
        assert_eq!(suite.tests, 3);
        assert_eq!(suite.failures, 1);
        assert_eq!(suite.errors, 1);
        assert_eq!(suite.passed(), 1);

        let failing = &suite.test_cases[1];
        assert!(failing.is_failing());
        assert_eq!(
            failing.failure.as_ref().unwrap().message,
            "expected error banner"
        );
        assert_eq!(failing.failure.as_ref().unwrap().body, "banner not found");
    }

    #[test]
    fn parses_bare_testsuite_root() {
        let xml = r#"<testsuite name="solo" tests="1" failures="0" errors="0">
            <testcase classname="a" name="works" time="0.1"/>
        </testsuite>"#;

        let report = parse(xml.as_bytes()).unwrap();
        assert_eq!(report.suites.len(), 1);
        assert_eq!(report.suites[0].name, "solo");
    }

    #[test]
    fn failed_tests_are_qualified_and_deduplicated() {
        let report = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            report.failed_tests(),
            vec![
                "e2e.login.rejects bad password".to_string(),
                "e2e.login.locks after retries".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse(b"not xml at all <<<").is_err());
    }
}
