//! Configuration schema definitions for provcheck.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for provider and step type selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig          - Core settings (parallelism, timeouts, polling)
//! ├── ProviderConfig         - Tagged enum selecting the cloud backend
//! │   ├── Local              - Directory-backed fake cloud
//! │   └── Script             - Command templates around a cloud CLI
//! ├── ReportConfig           - Output and reporting settings
//! └── CaseConfig[]           - Declarative test cases
//!     └── StepConfig[]       - script / expect_resource / expect_absent
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Root configuration structure for provcheck.
///
/// # Example
///
/// ```
/// use provcheck::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [harness]
///     max_parallel = 2
///
///     [provider]
///     type = "local"
///
///     [[cases]]
///     name = "storage"
///
///     [[cases.steps]]
///     type = "expect_absent"
///     name = "nothing"
/// "#).unwrap();
///
/// assert_eq!(config.harness.max_parallel, 2);
/// assert_eq!(config.cases[0].steps.len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core harness settings (optional, has defaults).
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Cloud backend the provisioning scripts target.
    pub provider: ProviderConfig,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,

    /// Test cases to run.
    #[serde(default)]
    pub cases: Vec<CaseConfig>,
}

/// Core harness settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `location` | `eastus` |
/// | `max_parallel` | 4 |
/// | `case_timeout_secs` | 900 (15 minutes) |
/// | `poll_interval_secs` | 5 |
/// | `retry_timeout_secs` | 300 |
/// | `teardown_timeout_secs` | 600 |
/// | `log_dir` | `testdata/logs` |
/// | `name_prefix` | `provcheck` |
/// | `strict_teardown` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Default location for namespaces.
    #[serde(default = "default_location")]
    pub location: String,

    /// Maximum number of cases running at the same time.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Overall budget per case, including provisioning.
    ///
    /// Teardown is not counted against it.
    #[serde(default = "default_case_timeout")]
    pub case_timeout_secs: u64,

    /// Fixed delay between retried attempts.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Default budget of one retried operation.
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: u64,

    /// Budget for deleting a namespace.
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_secs: u64,

    /// Directory receiving one log file per case.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Prefix of every namespace name.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Fail passing cases whose namespace could not be deleted.
    #[serde(default)]
    pub strict_teardown: bool,

    /// Working directory for provisioning scripts.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_location() -> String {
    "eastus".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_case_timeout() -> u64 {
    900
}

fn default_poll_interval() -> u64 {
    5
}

fn default_retry_timeout() -> u64 {
    300
}

fn default_teardown_timeout() -> u64 {
    600
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("testdata/logs")
}

fn default_name_prefix() -> String {
    "provcheck".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            max_parallel: default_max_parallel(),
            case_timeout_secs: default_case_timeout(),
            poll_interval_secs: default_poll_interval(),
            retry_timeout_secs: default_retry_timeout(),
            teardown_timeout_secs: default_teardown_timeout(),
            log_dir: default_log_dir(),
            name_prefix: default_name_prefix(),
            strict_teardown: false,
            working_dir: None,
        }
    }
}

impl HarnessConfig {
    /// Default policy for retried operations inside a case.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.retry_timeout_secs),
        )
    }

    /// Policy used while deleting namespaces.
    pub fn teardown_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.teardown_timeout_secs),
        )
    }
}

/// Cloud backend configuration.
///
/// ```toml
/// [provider]
/// type = "script"
/// create_command = "az group create -n {namespace} -l {location}"
/// delete_command = "az group delete -n {namespace} --yes"
/// get_command = "./testdata/get_resource.sh {namespace} {name}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Directory-backed fake cloud.
    Local(LocalProviderConfig),

    /// Cloud driven through shell command templates.
    Script(ScriptProviderConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Local(_) => "local",
            ProviderConfig::Script(_) => "script",
        }
    }
}

/// Configuration for the local provider.
///
/// Each namespace is a directory under `root` and each resource a JSON file
/// `<root>/<namespace>/<name>.json`. Scripts find the root in the
/// `PROVCHECK_CLOUD_ROOT` environment variable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
}

fn default_local_root() -> PathBuf {
    PathBuf::from(".provcheck/cloud")
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
        }
    }
}

/// Configuration for the script provider.
///
/// Templates may use `{namespace}`, `{location}` and `{name}`. Substituted
/// values are shell-quoted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptProviderConfig {
    /// Creates a namespace. Uses `{namespace}` and `{location}`.
    pub create_command: String,

    /// Deletes a namespace. Uses `{namespace}`.
    pub delete_command: String,

    /// Prints a resource descriptor as JSON. Uses `{namespace}` and `{name}`.
    pub get_command: String,

    /// Exit code meaning "does not exist".
    #[serde(default = "default_not_found_exit_code")]
    pub not_found_exit_code: i32,

    /// Working directory for the commands.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment for the commands and for provisioning scripts.
    ///
    /// Values support `$VAR` expansion.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run the templates.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Timeout of a single provider command.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_not_found_exit_code() -> i32 {
    3
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_command_timeout() -> u64 {
    600
}

/// Report output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML file.
    #[serde(default = "default_true")]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

/// A declarative test case.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaseConfig {
    pub name: String,

    /// Overrides `harness.case_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Overrides `harness.location`.
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One step of a case body, run in order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Script(ScriptStep),
    ExpectResource(ExpectResourceStep),
    ExpectAbsent(ExpectAbsentStep),
}

impl StepConfig {
    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            StepConfig::Script(s) => format!("script {}", s.script),
            StepConfig::ExpectResource(s) => format!("expect_resource {}", s.name),
            StepConfig::ExpectAbsent(s) => format!("expect_absent {}", s.name),
        }
    }
}

/// Runs a provisioning script.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptStep {
    pub script: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Store the script's side-channel output in this variable.
    #[serde(default)]
    pub capture: Option<String>,

    /// Output must equal this value.
    #[serde(default)]
    pub expect: Option<String>,

    /// Output, parsed as a list, must contain exactly these items.
    #[serde(default)]
    pub expect_items: Option<Vec<String>>,

    /// Run the script under the case retrier.
    #[serde(default)]
    pub retry: bool,
}

impl ScriptStep {
    /// Whether the script receives an output path argument.
    pub fn captures_output(&self) -> bool {
        self.capture.is_some() || self.expect.is_some() || self.expect_items.is_some()
    }
}

/// Waits until a resource exists with the given properties.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExpectResourceStep {
    pub name: String,

    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub sku: Option<String>,

    #[serde(default)]
    pub tier: Option<String>,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub disks: Vec<ExpectDisk>,

    /// Overrides `harness.retry_timeout_secs` for this step.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Expected disk attached to a resource.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExpectDisk {
    pub name: String,

    #[serde(default)]
    pub size_gb: Option<u64>,

    #[serde(default)]
    pub storage_type: Option<String>,
}

/// Waits until a resource no longer exists.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExpectAbsentStep {
    pub name: String,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}
