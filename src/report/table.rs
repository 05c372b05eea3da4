//! Console table reporter.

use std::sync::Mutex;
use std::time::Duration;

use super::{Reporter, TestResult, TestStatus};

/// Renders finished suites as a terminal table with a progress bar while
/// the run is in flight.
pub struct TableReporter {
    results: Mutex<Vec<TestResult>>,
    progress: Mutex<Option<indicatif::ProgressBar>>,
}

impl TableReporter {
    /// `total` is the number of scheduled suites, used to size the
    /// progress bar.
    pub fn new(total: usize) -> Self {
        let bar = indicatif::ProgressBar::new(total as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("static template is valid")
                .progress_chars("#>-"),
        );

        Self {
            results: Mutex::new(Vec::new()),
            progress: Mutex::new(Some(bar)),
        }
    }

    fn styled_status(status: TestStatus) -> console::StyledObject<String> {
        let text = status.to_string();
        match status {
            TestStatus::Passed => console::style(text).green(),
            TestStatus::Skipped | TestStatus::InProgress => console::style(text).yellow(),
            _ => console::style(text).red(),
        }
    }
}

impl Reporter for TableReporter {
    fn add(&self, result: &TestResult) {
        if let Some(bar) = self.progress.lock().unwrap().as_ref() {
            bar.inc(1);
            if result.status != TestStatus::Passed {
                bar.println(format!(
                    "{} {}",
                    Self::styled_status(result.status),
                    result.name
                ));
            }
        }
        self.results.lock().unwrap().push(result.clone());
    }

    fn render(&self) {
        if let Some(bar) = self.progress.lock().unwrap().take() {
            bar.finish_and_clear();
        }

        let results = self.results.lock().unwrap();
        if results.is_empty() {
            return;
        }

        let name_width = results
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(4)
            .max(4);

        println!();
        println!(
            "  {:<name_width$}  {:>9}  {:<11}  {:<16}  {:<12}  {:>8}",
            "Name", "Duration", "Status", "Browser", "Platform", "Attempts"
        );
        println!("  {}", "─".repeat(name_width + 66));

        let mut errors = 0usize;
        let mut total = Duration::ZERO;
        for r in results.iter() {
            if r.status.is_failure() {
                errors += 1;
            }
            total += r.duration;

            println!(
                "  {:<name_width$}  {:>8}s  {:<11}  {:<16}  {:<12}  {:>8}",
                r.name,
                r.duration.as_secs(),
                Self::styled_status(r.status),
                r.browser,
                r.platform,
                r.attempts.len(),
            );
        }

        println!();
        if errors == 0 {
            println!(
                "{}",
                console::style("All suites have passed").green().bold()
            );
        } else {
            println!(
                "{}",
                console::style(format!("{} of {} suites have failed", errors, results.len()))
                    .red()
                    .bold()
            );
            for r in results.iter().filter(|r| r.status.is_failure()) {
                let detail = if r.url.is_empty() {
                    r.status.to_string()
                } else {
                    format!("{} ({})", r.status, r.url)
                };
                println!("  ✖ {}: {}", r.name, console::style(detail).dim());
            }
        }
        println!();
        println!("Total duration: {}s", total.as_secs());
    }
}
