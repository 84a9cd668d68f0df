//! JUnit XML report generation.
//!
//! One `<testcase>` per provisioning case, so CI systems (Jenkins, GitLab,
//! GitHub Actions) can display the suite natively.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" time="412.031">
//!   <testsuite name="provcheck" tests="2" failures="1" errors="0" skipped="0" time="412.031">
//!     <testcase classname="provcheck.local" name="storage-account" time="201.442"/>
//!     <testcase classname="provcheck.local" name="vm-backup" time="210.589">
//!       <failure message="failed during running" type="running">step 3 ...</failure>
//!       <system-err>teardown: Namespace.Delete:... gave up after 12 attempt(s)</system-err>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Teardown problems never turn a passing case into a failure here; they
//! are attached as `<system-err>` so the namespace can be cleaned up by hand.

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::config::CaseConfig;
use crate::fixture::{CaseOutcome, CaseReport};
use crate::suite::SuiteResult;

/// Reporter that writes a JUnit XML file when the suite completes.
///
/// Parent directories are created automatically.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
    classname: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "provcheck".to_string(),
            classname: "provcheck".to_string(),
        }
    }

    /// Sets the test suite name in the XML output.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    /// Sets the `classname` attribute of every test case, typically
    /// `provcheck.<provider>`.
    pub fn with_classname(mut self, classname: impl Into<String>) -> Self {
        self.classname = classname.into();
        self
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.output_path
    }

    /// Generate JUnit XML content from a suite result.
    pub fn generate_xml(&self, result: &SuiteResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = result.total.to_string();
        let failures = result.failed.to_string();
        let skipped = result.not_run.to_string();
        let time = format!("{:.3}", result.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", "0"));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for report in &result.reports {
            self.write_testcase(&mut writer, report)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        report: &CaseReport,
    ) -> anyhow::Result<()> {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", self.classname.as_str()));
        testcase.push_attribute(("name", report.name.as_str()));
        testcase.push_attribute((
            "time",
            format!("{:.3}", report.duration.as_secs_f64()).as_str(),
        ));

        if report.passed() && report.teardown_error.is_none() {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }

        writer.write_event(Event::Start(testcase))?;

        match &report.outcome {
            CaseOutcome::Passed => {}
            CaseOutcome::Failed { phase, cause } => {
                let message = format!("failed during {}", phase);
                let mut failure = BytesStart::new("failure");
                failure.push_attribute(("message", message.as_str()));
                failure.push_attribute(("type", phase.to_string().as_str()));
                writer.write_event(Event::Start(failure))?;
                writer.write_event(Event::Text(BytesText::new(&strip_invalid_xml(cause))))?;
                writer.write_event(Event::End(BytesEnd::new("failure")))?;
            }
            CaseOutcome::NotRun { reason } => {
                let mut skipped = BytesStart::new("skipped");
                skipped.push_attribute(("message", strip_invalid_xml(reason).as_str()));
                writer.write_event(Event::Empty(skipped))?;
            }
        }

        if let Some(err) = &report.teardown_error {
            let namespace = report
                .namespace
                .as_ref()
                .map(|n| n.name.as_str())
                .unwrap_or("<unknown>");
            let text = format!("teardown of namespace {} failed: {}", namespace, err);
            writer.write_event(Event::Start(BytesStart::new("system-err")))?;
            writer.write_event(Event::Text(BytesText::new(&strip_invalid_xml(&text))))?;
            writer.write_event(Event::End(BytesEnd::new("system-err")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }

    fn write(&self, result: &SuiteResult) -> anyhow::Result<()> {
        let xml = self.generate_xml(result)?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_suite_start(&self, _cases: &[&CaseConfig]) {}

    async fn on_case_start(&self, _name: &str) {}

    async fn on_case_complete(&self, _report: &CaseReport) {}

    async fn on_suite_complete(&self, result: &SuiteResult) {
        match self.write(result) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {:#}", e),
        }
    }
}

/// Removes characters XML 1.0 cannot represent; quick-xml escapes the rest.
fn strip_invalid_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
