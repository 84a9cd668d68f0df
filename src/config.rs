//! Configuration loading and schema definitions for provcheck.
//!
//! This module provides types and functions for loading provcheck
//! configuration from TOML files or strings. Paths in the configuration
//! support `~` and `$VAR` expansion, as do provider environment values so
//! credentials never have to be written into the file itself.

pub mod schema;

pub use schema::*;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Loads provcheck configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - A path or environment value references an undefined variable
///
/// # Example
///
/// ```no_run
/// use provcheck::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("provcheck.toml"))?;
/// println!("Max parallel: {}", config.harness.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    expand(config)
}

/// Loads provcheck configuration from a TOML string.
///
/// # Example
///
/// ```
/// use provcheck::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     max_parallel = 4
///
///     [provider]
///     type = "local"
/// "#)?;
///
/// assert_eq!(config.harness.max_parallel, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    expand(config)
}

fn expand(mut config: Config) -> Result<Config> {
    config.harness.log_dir = expand_path(&config.harness.log_dir)?;
    if let Some(dir) = &config.harness.working_dir {
        config.harness.working_dir = Some(expand_path(dir)?);
    }
    config.report.output_dir = expand_path(&config.report.output_dir)?;

    match &mut config.provider {
        ProviderConfig::Local(local) => {
            local.root = expand_path(&local.root)?;
        }
        ProviderConfig::Script(script) => {
            if let Some(dir) = &script.working_dir {
                script.working_dir = Some(expand_path(dir)?);
            }
            for (key, value) in script.env.iter_mut() {
                let expanded = shellexpand::env(value.as_str())
                    .with_context(|| format!("Failed to expand provider env {}", key))?;
                *value = expanded.into_owned();
            }
        }
    }

    Ok(config)
}

/// Expands `~` and `$VAR` in a path.
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(raw.as_ref())
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Checks the configuration for mistakes serde cannot catch.
///
/// Returns the list of problems; an empty list means the configuration is
/// usable.
pub fn validate(config: &Config) -> Vec<String> {
    let mut problems = Vec::new();
    let harness = &config.harness;

    if harness.max_parallel == 0 {
        problems.push("harness.max_parallel must be at least 1".to_string());
    }
    if harness.poll_interval_secs == 0 {
        problems.push("harness.poll_interval_secs must be at least 1".to_string());
    }
    if harness.case_timeout_secs == 0 {
        problems.push("harness.case_timeout_secs must be at least 1".to_string());
    }
    if crate::names::sanitize(&harness.name_prefix).is_empty() {
        problems.push(format!(
            "harness.name_prefix {:?} has no usable characters",
            harness.name_prefix
        ));
    }

    let mut seen = HashSet::new();
    let mut log_files: HashMap<String, &str> = HashMap::new();
    for (idx, case) in config.cases.iter().enumerate() {
        if case.name.trim().is_empty() {
            problems.push(format!("cases[{}] has an empty name", idx));
        } else if !seen.insert(case.name.as_str()) {
            problems.push(format!("duplicate case name: {}", case.name));
        } else {
            let stem = crate::log::file_stem(&case.name);
            if let Some(other) = log_files.get(&stem) {
                problems.push(format!(
                    "cases {:?} and {:?} would share the log file {}.log",
                    other, case.name, stem
                ));
            } else {
                log_files.insert(stem, case.name.as_str());
            }
        }
        if case.steps.is_empty() {
            problems.push(format!("case {} has no steps", case.name));
        }
        for (step_idx, step) in case.steps.iter().enumerate() {
            if let StepConfig::Script(script) = step
                && script.script.trim().is_empty()
            {
                problems.push(format!(
                    "case {} step {} has an empty script",
                    case.name,
                    step_idx + 1
                ));
            }
        }
    }

    problems
}

/// Like [`validate`], but fails with all problems joined into one error.
pub fn ensure_valid(config: &Config) -> Result<()> {
    let problems = validate(config);
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }
    Ok(())
}
