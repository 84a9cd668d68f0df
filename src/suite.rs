//! Running configured cases concurrently.
//!
//! Each case becomes a [`FixtureRunner::run`] call whose body executes the
//! case's steps. Cases run in parallel up to `harness.max_parallel`; within
//! a case everything is sequential.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CaseConfig, Config};
use crate::fixture::{CaseOutcome, CaseReport, FixtureRunner, FixtureSettings};
use crate::provider::CloudProvider;
use crate::report::Reporter;
use crate::steps::run_steps;

/// Aggregated result of a suite run.
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,

    /// Cases whose namespace could not be deleted.
    pub leaked: usize,

    pub duration: Duration,

    /// Reports in configuration order.
    pub reports: Vec<CaseReport>,
}

impl SuiteResult {
    pub fn from_reports(reports: Vec<CaseReport>, duration: Duration) -> Self {
        let count = |f: fn(&CaseReport) -> bool| reports.iter().filter(|r| f(r)).count();
        Self {
            total: reports.len(),
            passed: count(|r| r.passed()),
            failed: count(|r| matches!(r.outcome, CaseOutcome::Failed { .. })),
            not_run: count(|r| matches!(r.outcome, CaseOutcome::NotRun { .. })),
            leaked: count(|r| r.leaked()),
            duration,
            reports,
        }
    }

    /// Returns true if every case passed and nothing leaked.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0 && self.leaked == 0
    }

    /// Process exit code.
    ///
    /// - 0: all cases passed, all namespaces deleted
    /// - 1: some case failed or did not run
    /// - 2: all cases passed but some namespace may be leaked
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.not_run > 0 {
            1
        } else if self.leaked > 0 {
            2
        } else {
            0
        }
    }
}

/// Runs the cases of one configuration against one provider.
pub struct Suite<'a, P: ?Sized, R> {
    config: &'a Config,
    runner: FixtureRunner<P>,
    reporter: R,
    max_parallel_override: Option<usize>,
}

impl<'a, P, R> Suite<'a, P, R>
where
    P: CloudProvider + ?Sized + 'static,
    R: Reporter,
{
    pub fn new(config: &'a Config, provider: Arc<P>, reporter: R) -> Self {
        let runner = FixtureRunner::new(provider, FixtureSettings::from_config(&config.harness));
        Self {
            config,
            runner,
            reporter,
            max_parallel_override: None,
        }
    }

    /// Cancelling `token` stops running cases (after teardown) and skips
    /// cases that have not started yet.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.runner = self.runner.with_cancellation(token);
        self
    }

    /// Overrides `harness.max_parallel`.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel_override = Some(max_parallel);
        self
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Cases whose name contains `filter` (all cases without a filter).
    pub fn selected(&self, filter: Option<&str>) -> Vec<&'a CaseConfig> {
        self.config
            .cases
            .iter()
            .filter(|case| filter.is_none_or(|f| case.name.contains(f)))
            .collect()
    }

    /// Runs the selected cases and returns the aggregated result.
    pub async fn run(&self, filter: Option<&str>) -> SuiteResult {
        let start = Instant::now();
        let cases = self.selected(filter);
        let max_parallel = self
            .max_parallel_override
            .unwrap_or(self.config.harness.max_parallel)
            .max(1);

        info!(
            cases = cases.len(),
            max_parallel,
            provider = self.runner.provider().name(),
            "Starting suite"
        );
        self.reporter.on_suite_start(&cases).await;

        let semaphore = Semaphore::new(max_parallel);
        let slots: Mutex<Vec<Option<CaseReport>>> = Mutex::new(vec![None; cases.len()]);

        // Scoped spawns borrow the config and the reporter without 'static.
        tokio_scoped::scope(|scope| {
            for (idx, case) in cases.iter().enumerate() {
                let semaphore = &semaphore;
                let slots = &slots;

                scope.spawn(async move {
                    let report = match semaphore.acquire().await {
                        Ok(_permit) => self.run_case(case).await,
                        Err(_) => CaseReport::not_run(&case.name, "suite shut down"),
                    };
                    self.reporter.on_case_complete(&report).await;
                    slots.lock().await[idx] = Some(report);
                });
            }
        });

        let reports: Vec<CaseReport> = slots.into_inner().into_iter().flatten().collect();
        let result = SuiteResult::from_reports(reports, start.elapsed());

        if result.leaked > 0 {
            warn!(leaked = result.leaked, "Some namespaces could not be deleted");
        }
        info!(
            passed = result.passed,
            failed = result.failed,
            not_run = result.not_run,
            duration = ?result.duration,
            "Suite finished"
        );

        self.reporter.on_suite_complete(&result).await;
        result
    }

    async fn run_case(&self, case: &CaseConfig) -> CaseReport {
        if self.runner.cancellation_token().is_cancelled() {
            return CaseReport::not_run(&case.name, "suite cancelled before the case started");
        }

        self.reporter.on_case_start(&case.name).await;

        let harness = &self.config.harness;
        let timeout = Duration::from_secs(case.timeout_secs.unwrap_or(harness.case_timeout_secs));
        let location = case.location.as_deref().unwrap_or(&harness.location);
        let steps = case.steps.clone();

        self.runner
            .run(&case.name, timeout, location, move |ctx| run_steps(ctx, steps))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, load_config_str};
    use crate::provider::local::LocalProvider;
    use crate::report::NullReporter;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(temp_dir: &Path, cases: &str) -> Config {
        let toml = format!(
            r#"
            [harness]
            max_parallel = 2
            poll_interval_secs = 1
            retry_timeout_secs = 2
            teardown_timeout_secs = 5
            log_dir = "{dir}/logs"

            [provider]
            type = "local"
            root = "{dir}/cloud"

            {cases}
            "#,
            dir = temp_dir.display(),
            cases = cases
        );
        load_config_str(&toml).unwrap()
    }

    fn provider(config: &Config) -> Arc<LocalProvider> {
        match &config.provider {
            ProviderConfig::Local(local) => Arc::new(LocalProvider::new(local.clone())),
            other => panic!("unexpected provider: {:?}", other),
        }
    }

    const CASES: &str = r#"
        [[cases]]
        name = "passes"

        [[cases.steps]]
        type = "script"
        script = "sh"
        args = ["-c", "printf ok > \"$0\""]
        expect = "ok"

        [[cases]]
        name = "fails"

        [[cases.steps]]
        type = "script"
        script = "sh"
        args = ["-c", "exit 1"]

        [[cases]]
        name = "also-passes"

        [[cases.steps]]
        type = "expect_absent"
        name = "nothing"
    "#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suite_aggregates_reports() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), CASES);
        let suite = Suite::new(&config, provider(&config), NullReporter);

        let result = suite.run(None).await;

        assert_eq!(result.total, 3);
        assert_eq!(result.passed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.leaked, 0);
        assert_eq!(result.exit_code(), 1);
        let names: Vec<&str> = result.reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["passes", "fails", "also-passes"]);

        // Every namespace is gone.
        let cloud = temp_dir.path().join("cloud");
        let leftovers = std::fs::read_dir(&cloud).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_filter_selects_cases() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), CASES);
        let suite = Suite::new(&config, provider(&config), NullReporter);

        assert_eq!(suite.selected(Some("passes")).len(), 2);
        let result = suite.run(Some("also")).await;
        assert_eq!(result.total, 1);
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_suite_skips_cases() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), CASES);
        let token = CancellationToken::new();
        token.cancel();
        let suite =
            Suite::new(&config, provider(&config), NullReporter).with_cancellation(token);

        let result = suite.run(None).await;
        assert_eq!(result.not_run, 3);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        let passed = CaseReport {
            name: "a".to_string(),
            namespace: None,
            outcome: CaseOutcome::Passed,
            teardown_error: None,
            duration: Duration::ZERO,
            log_path: None,
        };
        let mut leaked = passed.clone();
        leaked.teardown_error = Some("conflict".to_string());

        let result = SuiteResult::from_reports(vec![passed.clone()], Duration::ZERO);
        assert_eq!(result.exit_code(), 0);

        let result = SuiteResult::from_reports(vec![passed, leaked], Duration::ZERO);
        assert_eq!(result.leaked, 1);
        assert!(!result.success());
        assert_eq!(result.exit_code(), 2);
    }
}
