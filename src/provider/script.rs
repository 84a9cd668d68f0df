//! Provider driven by shell command templates.
//!
//! This provider integrates with any cloud that has a CLI: the three
//! lifecycle operations are user-defined shell commands, so the harness
//! never links against a cloud SDK.
//!
//! # Command Protocol
//!
//! | Template | Placeholders | Contract |
//! |----------|--------------|----------|
//! | `create_command` | `{namespace}`, `{location}` | exit 0 on success |
//! | `delete_command` | `{namespace}` | exit 0 on success, `not_found_exit_code` if absent |
//! | `get_command` | `{namespace}`, `{name}` | prints the descriptor as JSON, `not_found_exit_code` if absent |
//!
//! The get command may print diagnostics before the descriptor; the last
//! stdout line starting with `{` is parsed when the whole output is not
//! valid JSON.
//!
//! ```json
//! {"name": "stabc", "kind": "BlobStorage", "sku": "Standard_LRS", "tier": "Hot"}
//! ```
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "script"
//! create_command = "az group create -n {namespace} -l {location}"
//! delete_command = "./testdata/delete_group.sh {namespace}"
//! get_command = "./testdata/get_resource.sh {namespace} {name}"
//! not_found_exit_code = 3
//!
//! [provider.env]
//! AZURE_SUBSCRIPTION_ID = "$AZURE_SUBSCRIPTION_ID"
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{CloudProvider, Namespace, ProviderError, ProviderResult, ResourceDescriptor};
use crate::config::ScriptProviderConfig;

/// Output of one provider command.
#[derive(Debug, Clone)]
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Provider that shells out for every operation.
pub struct ScriptProvider {
    config: ScriptProviderConfig,
}

impl ScriptProvider {
    pub fn new(config: ScriptProviderConfig) -> Self {
        Self { config }
    }

    /// Substitutes `{key}` placeholders with shell-quoted values.
    fn render(template: &str, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), &shell_words::quote(value))
        })
    }

    async fn run(&self, command: &str) -> ProviderResult<CommandOutput> {
        debug!(provider = "script", "Running: {}", command);

        let mut cmd = tokio::process::Command::new(&self.config.shell);
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(format!("provider command timed out: {}", command)))?
        .map_err(|e| ProviderError::ExecFailed(format!("Failed to run {}: {}", command, e)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn is_not_found(&self, output: &CommandOutput) -> bool {
        output.exit_code == self.config.not_found_exit_code
    }
}

/// Heuristic for rate limiting reported on stderr.
fn is_throttled(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("throttl") || lower.contains("toomanyrequests") || lower.contains("429")
}

fn parse_descriptor(stdout: &str) -> ProviderResult<ResourceDescriptor> {
    if let Ok(descriptor) = serde_json::from_str::<ResourceDescriptor>(stdout.trim()) {
        return Ok(descriptor);
    }

    let line = stdout
        .lines()
        .rev()
        .find(|line| line.trim().starts_with('{'))
        .ok_or_else(|| {
            ProviderError::InvalidResponse(format!("no JSON descriptor in output: {}", stdout.trim()))
        })?;

    serde_json::from_str(line.trim())
        .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, line.trim())))
}

#[async_trait]
impl CloudProvider for ScriptProvider {
    async fn create_namespace(&self, name: &str, location: &str) -> ProviderResult<Namespace> {
        let command = Self::render(
            &self.config.create_command,
            &[("namespace", name), ("location", location)],
        );
        info!(namespace = name, location, "Creating namespace");

        let output = self.run(&command).await?;
        if output.exit_code != 0 {
            if is_throttled(&output.stderr) {
                return Err(ProviderError::Throttled(output.stderr.trim().to_string()));
            }
            return Err(ProviderError::CreateFailed(format!(
                "{} (exit {}): {}",
                name,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(Namespace::new(name, location))
    }

    async fn delete_namespace(&self, name: &str) -> ProviderResult<()> {
        let command = Self::render(&self.config.delete_command, &[("namespace", name)]);
        info!(namespace = name, "Deleting namespace");

        let output = self.run(&command).await?;
        if output.exit_code == 0 {
            return Ok(());
        }
        if self.is_not_found(&output) {
            return Err(ProviderError::NotFound(format!("namespace {}", name)));
        }
        if is_throttled(&output.stderr) {
            return Err(ProviderError::Throttled(output.stderr.trim().to_string()));
        }

        warn!(namespace = name, exit_code = output.exit_code, "Delete command failed");
        Err(ProviderError::DeleteFailed(format!(
            "{} (exit {}): {}",
            name,
            output.exit_code,
            output.stderr.trim()
        )))
    }

    async fn get_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<ResourceDescriptor> {
        let command = Self::render(
            &self.config.get_command,
            &[("namespace", namespace), ("name", name)],
        );

        let output = self.run(&command).await?;
        if self.is_not_found(&output) {
            return Err(ProviderError::NotFound(format!("{}/{}", namespace, name)));
        }
        if output.exit_code != 0 {
            if is_throttled(&output.stderr) {
                return Err(ProviderError::Throttled(output.stderr.trim().to_string()));
            }
            return Err(ProviderError::ExecFailed(format!(
                "get {}/{} exited with {}: {}",
                namespace,
                name,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let mut descriptor = parse_descriptor(&output.stdout)?;
        if descriptor.name.is_empty() {
            descriptor.name = name.to_string();
        }
        Ok(descriptor)
    }

    fn name(&self) -> &'static str {
        "script"
    }

    fn script_env(&self) -> Vec<(String, String)> {
        self.config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Provider whose "cloud" is a directory inside `temp_dir`.
    fn provider(temp_dir: &TempDir) -> ScriptProvider {
        let root = temp_dir.path().display().to_string();
        ScriptProvider::new(ScriptProviderConfig {
            create_command: "mkdir \"$ROOT\"/{namespace} && echo {location} > \"$ROOT\"/{namespace}/.location".to_string(),
            delete_command: "test -d \"$ROOT\"/{namespace} || exit 3; rm -rf \"$ROOT\"/{namespace}".to_string(),
            get_command: "f=\"$ROOT\"/{namespace}/{name}.json; test -f \"$f\" || exit 3; echo looking up >&2; echo progress; cat \"$f\"".to_string(),
            not_found_exit_code: 3,
            working_dir: None,
            env: HashMap::from([("ROOT".to_string(), root)]),
            shell: "/bin/sh".to_string(),
            timeout_secs: 30,
        })
    }

    #[test]
    fn test_render_quotes_values() {
        let rendered = ScriptProvider::render(
            "create -n {namespace} -l {location}",
            &[("namespace", "rg 1"), ("location", "eastus")],
        );
        assert_eq!(rendered, "create -n 'rg 1' -l eastus");
    }

    #[test]
    fn test_parse_descriptor_after_noise() {
        let descriptor =
            parse_descriptor("warming up\n{\"name\": \"st1\", \"tier\": \"Hot\"}\n").unwrap();
        assert_eq!(descriptor.tier.as_deref(), Some("Hot"));

        match parse_descriptor("nothing useful") {
            Err(ProviderError::InvalidResponse(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_throttling_heuristic() {
        assert!(is_throttled("ERROR: (TooManyRequests) slow down"));
        assert!(is_throttled("request was throttled"));
        assert!(!is_throttled("ResourceGroupNotFound"));
    }

    #[tokio::test]
    async fn test_lifecycle_through_commands() {
        let temp_dir = TempDir::new().unwrap();
        let provider = provider(&temp_dir);

        let namespace = provider.create_namespace("rg-1", "eastus").await.unwrap();
        assert_eq!(namespace.name, "rg-1");
        assert!(temp_dir.path().join("rg-1").is_dir());

        match provider.get_resource("rg-1", "st1").await {
            Err(ProviderError::NotFound(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        std::fs::write(
            temp_dir.path().join("rg-1").join("st1.json"),
            r#"{"kind": "BlobStorage", "sku": "Standard_LRS"}"#,
        )
        .unwrap();
        let account = provider.get_resource("rg-1", "st1").await.unwrap();
        assert_eq!(account.name, "st1");
        assert_eq!(account.require_sku().unwrap(), "Standard_LRS");

        provider.delete_namespace("rg-1").await.unwrap();
        match provider.delete_namespace("rg-1").await {
            Err(ProviderError::NotFound(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_failure_carries_stderr() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = provider(&temp_dir).config;
        config.create_command = "echo quota exceeded >&2; exit 1".to_string();
        let provider = ScriptProvider::new(config);

        match provider.create_namespace("rg-1", "eastus").await {
            Err(ProviderError::CreateFailed(msg)) => assert!(msg.contains("quota exceeded")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = provider(&temp_dir).config;
        config.get_command = "sleep 5".to_string();
        config.timeout_secs = 0;
        let provider = ScriptProvider::new(config);

        match provider.get_resource("rg-1", "st1").await {
            Err(ProviderError::Timeout(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_script_env_is_forwarded() {
        let temp_dir = TempDir::new().unwrap();
        let env = provider(&temp_dir).script_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "ROOT");
    }
}
