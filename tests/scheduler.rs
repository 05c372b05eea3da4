//! Scheduler properties exercised through the public API against an
//! instrumented fake backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeCloudService, Outcome, project_with_suites};
use stratus::orchestrator::Orchestrator;
use stratus::report::TestStatus;
use stratus::retry::ThresholdRetrier;

fn orchestrator(
    project: stratus::Project,
    service: Arc<FakeCloudService>,
) -> Orchestrator<FakeCloudService> {
    Orchestrator::new(project, service, Box::new(ThresholdRetrier))
        .with_poll_interval(Duration::from_millis(1))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn in_flight_attempts_never_exceed_effective_concurrency() {
    let project = project_with_suites(20);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(10)));
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 3)
        .await;

    assert_eq!(result.total, 20);
    assert!(
        service.max_in_flight() <= 3,
        "observed {} concurrent attempts with ccy=3",
        service.max_in_flight()
    );
    assert!(result.all_passed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_result_per_suite() {
    let project = project_with_suites(9);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(2)));
    // Mixed outcomes; completion order is scrambled by staggered delays.
    service.script("suite-3", &[Outcome::Fail]);
    service.script("suite-7", &[Outcome::StartError]);
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 4)
        .await;

    assert_eq!(result.total, 9);
    let mut names: Vec<&str> = result.results.iter().map(|r| r.name.as_str()).collect();
    names.sort();
    let want: Vec<String> = (1..=9).map(|i| format!("suite-{i}")).collect();
    let mut want: Vec<&str> = want.iter().map(String::as_str).collect();
    want.sort();
    assert_eq!(names, want, "no suite may be lost or duplicated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suite_recovers_within_its_retry_budget() {
    // 3 suites, ccy=2: suite-2 fails twice, then passes.
    let mut project = project_with_suites(3);
    for suite in &mut project.suites {
        suite.retries = Some(2);
        suite.pass_threshold = 1;
    }
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(2)));
    service.script("suite-2", &[Outcome::Fail, Outcome::Fail, Outcome::Pass]);
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 2)
        .await;

    assert_eq!(result.total, 3);
    assert!(result.all_passed(), "the recovery must count as a pass");

    let flaky = result
        .results
        .iter()
        .find(|r| r.name == "suite-2")
        .expect("suite-2 must have a result");
    assert_eq!(flaky.attempts.len(), 3);
    assert_eq!(flaky.status, TestStatus::Passed);
    assert_eq!(flaky.attempts[0].status, TestStatus::Failed);
    assert_eq!(flaky.attempts[2].status, TestStatus::Passed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempts_are_bounded_by_retries_plus_one() {
    let mut project = project_with_suites(1);
    project.suites[0].retries = Some(3);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(1)));
    service.script("suite-1", &[Outcome::Fail; 10]);
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 1)
        .await;

    assert_eq!(result.results[0].attempts.len(), 4);
    assert_eq!(result.results[0].status, TestStatus::Failed);
    assert!(!result.all_passed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeouts_are_reported_distinctly_and_stop_the_job() {
    let project = project_with_suites(2);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(1)));
    service.script("suite-1", &[Outcome::Timeout]);
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 2)
        .await;

    let timed_out = result
        .results
        .iter()
        .find(|r| r.name == "suite-1")
        .unwrap();
    assert_eq!(timed_out.status, TestStatus::TimedOut);
    assert!(service.stops() >= 1, "the driver must stop a timed-out job");

    // The sibling suite is unaffected.
    let sibling = result
        .results
        .iter()
        .find(|r| r.name == "suite-2")
        .unwrap();
    assert_eq!(sibling.status, TestStatus::Passed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_failures_only_fail_the_owning_suite() {
    let project = project_with_suites(3);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(1)));
    service.script("suite-2", &[Outcome::StartError]);
    let suites = project.suites.clone();

    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 2)
        .await;

    assert_eq!(result.failed, 1);
    assert_eq!(result.passed, 2);

    let errored = result
        .results
        .iter()
        .find(|r| r.name == "suite-2")
        .unwrap();
    assert_eq!(errored.status, TestStatus::Errored);
    assert!(errored.attempts[0].job_id.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fail_fast_skips_undispatched_suites_without_losing_them() {
    let mut project = project_with_suites(6);
    project.stratus.fail_fast = true;
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(5)));
    service.script("suite-1", &[Outcome::Fail]);
    let suites = project.suites.clone();

    // One worker makes dispatch order deterministic.
    let result = orchestrator(project, Arc::clone(&service))
        .run_suites(suites, 1)
        .await;

    assert_eq!(result.total, 6, "skipped suites still appear in the report");
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 5);
    assert!(
        result
            .results
            .iter()
            .filter(|r| r.name != "suite-1")
            .all(|r| r.status == TestStatus::Skipped)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_mode_reports_in_progress_after_start() {
    let project = project_with_suites(3);
    let service = Arc::new(FakeCloudService::new(Duration::from_millis(1)));
    let suites = project.suites.clone();

    let result = Orchestrator::new(
        project,
        Arc::clone(&service),
        Box::new(ThresholdRetrier),
    )
    .with_async(true)
    .run_suites(suites, 2)
    .await;

    assert_eq!(result.total, 3);
    assert_eq!(result.in_progress, 3);
    assert!(result.all_passed(), "unknown outcomes don't fail the run");
    assert!(
        result
            .results
            .iter()
            .all(|r| r.status == TestStatus::InProgress && r.attempts.len() == 1)
    );
}
