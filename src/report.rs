//! Suite reporting and output generation.

pub mod junit;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::CaseConfig;
use crate::fixture::{CaseOutcome, CaseReport};
use crate::suite::SuiteResult;

pub use junit::JUnitReporter;

/// A reporter receives events while a suite runs.
///
/// Events for different cases arrive concurrently.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the cases to run are known.
    async fn on_suite_start(&self, cases: &[&CaseConfig]);

    /// Called when a case starts provisioning.
    async fn on_case_start(&self, name: &str);

    /// Called after a case has been torn down.
    async fn on_case_complete(&self, report: &CaseReport);

    /// Called when all cases have completed.
    async fn on_suite_complete(&self, result: &SuiteResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_suite_start(&self, _cases: &[&CaseConfig]) {}
    async fn on_case_start(&self, _name: &str) {}
    async fn on_case_complete(&self, _report: &CaseReport) {}
    async fn on_suite_complete(&self, _result: &SuiteResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_suite_start(&self, cases: &[&CaseConfig]) {
        for reporter in &self.reporters {
            reporter.on_suite_start(cases).await;
        }
    }

    async fn on_case_start(&self, name: &str) {
        for reporter in &self.reporters {
            reporter.on_case_start(name).await;
        }
    }

    async fn on_case_complete(&self, report: &CaseReport) {
        for reporter in &self.reporters {
            reporter.on_case_complete(report).await;
        }
    }

    async fn on_suite_complete(&self, result: &SuiteResult) {
        for reporter in &self.reporters {
            reporter.on_suite_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_suite_start(&self, cases: &[&CaseConfig]) {
        println!("Running {} cases", cases.len());

        let pb = indicatif::ProgressBar::new(cases.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_case_start(&self, name: &str) {
        if self.verbose {
            self.println(format!("Starting: {}", name));
        }
    }

    async fn on_case_complete(&self, report: &CaseReport) {
        let status = match report.outcome {
            CaseOutcome::Passed => console::style("PASS").green(),
            CaseOutcome::Failed { .. } => console::style("FAIL").red(),
            CaseOutcome::NotRun { .. } => console::style("SKIP").yellow(),
        };

        if self.verbose || !report.passed() {
            self.println(format!(
                "{} {} ({:.1}s)",
                status,
                report.name,
                report.duration.as_secs_f64()
            ));
        }
        if let Some(err) = &report.teardown_error {
            self.println(format!(
                "{} {}: namespace may be leaked: {}",
                console::style("LEAK").yellow().bold(),
                report.name,
                err
            ));
        }

        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
        }
    }

    async fn on_suite_complete(&self, result: &SuiteResult) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }
        print_summary(result);
    }
}

/// Prints a summary of suite results to the console.
pub fn print_summary(result: &SuiteResult) {
    println!();
    println!("Results:");
    println!("  Total:   {}", result.total);
    println!("  Passed:  {}", console::style(result.passed).green());
    println!("  Failed:  {}", console::style(result.failed).red());

    if result.not_run > 0 {
        println!("  Not Run: {}", console::style(result.not_run).red().bold());
    }
    if result.leaked > 0 {
        println!("  Leaked:  {}", console::style(result.leaked).yellow().bold());
    }

    println!("  Duration: {:?}", result.duration);
    println!();

    if result.success() {
        println!("{}", console::style("All cases passed!").green().bold());
        return;
    }

    if result.failed > 0 || result.not_run > 0 {
        println!("{}", console::style("Some cases failed.").red().bold());
        println!();
        println!("Failed cases:");
        for report in result.reports.iter().filter(|r| !r.passed()) {
            println!("  - {}", report.name);
            if let Some(cause) = report.cause() {
                for line in cause.lines() {
                    println!("    {}", console::style(line).dim());
                }
            }
            if let Some(path) = &report.log_path {
                println!("    log: {}", path.display());
            }
        }
    }

    if result.leaked > 0 {
        println!();
        println!(
            "{}",
            console::style("Some namespaces could not be deleted:")
                .yellow()
                .bold()
        );
        for report in result.reports.iter().filter(|r| r.leaked()) {
            let namespace = report
                .namespace
                .as_ref()
                .map(|n| n.name.as_str())
                .unwrap_or("<unknown>");
            println!("  - {} ({})", namespace, report.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reporter for Counting {
        async fn on_suite_start(&self, _cases: &[&CaseConfig]) {}
        async fn on_case_start(&self, _name: &str) {}
        async fn on_case_complete(&self, _report: &CaseReport) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_suite_complete(&self, _result: &SuiteResult) {}
    }

    #[tokio::test]
    async fn test_multi_reporter_fans_out() {
        let count = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Counting(count.clone()))
            .with_reporter(Counting(count.clone()))
            .with_reporter(NullReporter);

        multi
            .on_case_complete(&CaseReport::not_run("x", "skipped"))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_console_reporter_without_progress_bar() {
        let reporter = ConsoleReporter::new(true);
        reporter.on_case_start("case").await;
        reporter
            .on_case_complete(&CaseReport::not_run("case", "skipped"))
            .await;
        reporter
            .on_suite_complete(&SuiteResult::from_reports(Vec::new(), Duration::ZERO))
            .await;
    }
}
