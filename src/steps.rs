//! Case bodies built from configuration.
//!
//! A configured case is a list of steps run in order inside one
//! [`TestContext`]. String fields of a step are templates:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{namespace}` | Name of the case namespace |
//! | `{location}` | Location of the case namespace |
//! | `{case}` | Case name |
//! | `{unique:<prefix>}` | `unique_name(prefix)`, stable per prefix within a case |
//! | `{compact:<prefix>}` | `compact_unique_name(prefix, 24)`, stable per prefix within a case |
//! | `{var:<name>}` | Output captured by an earlier script step |
//!
//! `{{` and `}}` produce literal braces.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};

use crate::config::{ExpectAbsentStep, ExpectResourceStep, ScriptStep, StepConfig};
use crate::fixture::TestContext;
use crate::names;
use crate::provider::{CloudProvider, ResourceDescriptor};
use crate::script::parse_list;

/// Length limit of `{compact:...}` names (storage account rule).
pub const COMPACT_NAME_LEN: usize = 24;

/// Values available to step templates.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    namespace: String,
    location: String,
    case: String,
    unique: HashMap<String, String>,
    compact: HashMap<String, String>,
    vars: HashMap<String, String>,
}

impl Variables {
    pub fn new(
        namespace: impl Into<String>,
        location: impl Into<String>,
        case: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            location: location.into(),
            case: case.into(),
            ..Default::default()
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Substitutes every placeholder in `template`.
    pub fn expand(&mut self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") {
                out.push('{');
                rest = &tail[2..];
            } else if tail.starts_with("}}") {
                out.push('}');
                rest = &tail[2..];
            } else if tail.starts_with('}') {
                bail!("unmatched '}}' in {:?}", template);
            } else {
                let end = tail
                    .find('}')
                    .ok_or_else(|| anyhow!("unterminated placeholder in {:?}", template))?;
                let value = self.resolve(&tail[1..end])?;
                out.push_str(&value);
                rest = &tail[end + 1..];
            }
        }
        out.push_str(rest);

        Ok(out)
    }

    fn resolve(&mut self, key: &str) -> Result<String> {
        let (kind, arg) = match key.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (key, None),
        };

        match (kind, arg) {
            ("namespace", None) => Ok(self.namespace.clone()),
            ("location", None) => Ok(self.location.clone()),
            ("case", None) => Ok(self.case.clone()),
            ("unique", Some(prefix)) => Ok(self
                .unique
                .entry(prefix.to_string())
                .or_insert_with(|| names::unique_name(prefix))
                .clone()),
            ("compact", Some(prefix)) => Ok(self
                .compact
                .entry(prefix.to_string())
                .or_insert_with(|| names::compact_unique_name(prefix, COMPACT_NAME_LEN))
                .clone()),
            ("var", Some(name)) => self
                .get(name)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("variable {} is not set", name)),
            _ => bail!("unknown placeholder {{{}}}", key),
        }
    }
}

/// Runs `steps` in order; the first failing step fails the case.
pub async fn run_steps<P>(ctx: TestContext<P>, steps: Vec<StepConfig>) -> Result<()>
where
    P: CloudProvider + ?Sized,
{
    let mut vars = Variables::new(ctx.namespace(), ctx.location(), ctx.log.case());

    for (idx, step) in steps.iter().enumerate() {
        let number = idx + 1;
        ctx.log.line(format!("step {}: {}", number, step.describe()));

        let result = match step {
            StepConfig::Script(step) => run_script(&ctx, &mut vars, step).await,
            StepConfig::ExpectResource(step) => expect_resource(&ctx, &mut vars, step).await,
            StepConfig::ExpectAbsent(step) => expect_absent(&ctx, &mut vars, step).await,
        };
        result.with_context(|| format!("step {} ({})", number, step.describe()))?;
    }

    Ok(())
}

/// Expectations on a script's output.
struct OutputCheck {
    exact: Option<String>,
    items: Option<Vec<String>>,
}

impl OutputCheck {
    fn check(&self, output: &str) -> Result<()> {
        if let Some(expected) = &self.exact {
            ensure!(
                output == expected,
                "expected output {:?}, got {:?}",
                expected,
                output
            );
        }
        if let Some(expected) = &self.items {
            let mut actual = parse_list(output);
            actual.sort();
            let mut expected = expected.clone();
            expected.sort();
            ensure!(
                actual == expected,
                "expected items {:?}, got {:?}",
                expected,
                actual
            );
        }
        Ok(())
    }
}

async fn run_script<P>(ctx: &TestContext<P>, vars: &mut Variables, step: &ScriptStep) -> Result<()>
where
    P: CloudProvider + ?Sized,
{
    let program = vars.expand(&step.script)?;
    let args = step
        .args
        .iter()
        .map(|arg| vars.expand(arg))
        .collect::<Result<Vec<_>>>()?;
    let check = OutputCheck {
        exact: step.expect.as_deref().map(|e| vars.expand(e)).transpose()?,
        items: step
            .expect_items
            .as_ref()
            .map(|items| items.iter().map(|i| vars.expand(i)).collect::<Result<Vec<_>>>())
            .transpose()?,
    };

    let scripts = &ctx.scripts;
    let program = program.as_str();
    let args = &args;
    let check = &check;
    let captures = step.captures_output();

    let attempt = move || async move {
        if captures {
            let output = scripts.run_capturing_output(program, args).await?;
            check.check(&output)?;
            Ok::<_, anyhow::Error>(Some(output))
        } else {
            scripts.run(program, args).await?;
            Ok(None)
        }
    };

    let output = if step.retry {
        ctx.retrier
            .run(&format!("Script.Run:{}", program), attempt)
            .await?
    } else {
        attempt().await?
    };

    if let (Some(name), Some(output)) = (&step.capture, output) {
        ctx.log.line(format!("captured {} = {:?}", name, output));
        vars.set(name.clone(), output);
    }
    Ok(())
}

/// Expected properties of a resource; unset fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct ResourceExpectation {
    pub kind: Option<String>,
    pub location: Option<String>,
    pub sku: Option<String>,
    pub tier: Option<String>,
    pub size: Option<String>,
    pub disks: Vec<(String, Option<u64>, Option<String>)>,
}

impl ResourceExpectation {
    /// Fails with the first mismatch.
    pub fn check(&self, resource: &ResourceDescriptor) -> Result<()> {
        if let Some(kind) = &self.kind {
            let actual = resource.require_kind()?;
            ensure!(actual == kind, "kind: expected {}, got {}", kind, actual);
        }
        if let Some(location) = &self.location {
            let actual = resource.require_location()?;
            ensure!(
                normalize_location(actual) == normalize_location(location),
                "location: expected {}, got {}",
                location,
                actual
            );
        }
        if let Some(sku) = &self.sku {
            let actual = resource.require_sku()?;
            ensure!(actual == sku, "sku: expected {}, got {}", sku, actual);
        }
        if let Some(tier) = &self.tier {
            let actual = resource.require_tier()?;
            ensure!(actual == tier, "tier: expected {}, got {}", tier, actual);
        }
        if let Some(size) = &self.size {
            let actual = resource.require_size()?;
            ensure!(actual == size, "size: expected {}, got {}", size, actual);
        }
        for (name, size_gb, storage_type) in &self.disks {
            let disk = resource
                .disk(name)
                .ok_or_else(|| anyhow!("disk {} not attached to {}", name, resource.name))?;
            if let Some(expected) = size_gb {
                ensure!(
                    disk.size_gb == Some(*expected),
                    "disk {}: expected {} GB, got {:?}",
                    name,
                    expected,
                    disk.size_gb
                );
            }
            if let Some(expected) = storage_type {
                ensure!(
                    disk.storage_type.as_deref() == Some(expected.as_str()),
                    "disk {}: expected storage type {}, got {:?}",
                    name,
                    expected,
                    disk.storage_type
                );
            }
        }
        Ok(())
    }
}

/// "East US" and "eastus" name the same location.
fn normalize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn step_context<P: ?Sized>(ctx: &TestContext<P>, timeout_secs: Option<u64>) -> TestContext<P>
where
    P: CloudProvider,
{
    match timeout_secs {
        Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
        None => ctx.clone(),
    }
}

async fn expect_resource<P>(
    ctx: &TestContext<P>,
    vars: &mut Variables,
    step: &ExpectResourceStep,
) -> Result<()>
where
    P: CloudProvider + ?Sized,
{
    let name = vars.expand(&step.name)?;
    let mut expand_opt =
        |value: &Option<String>| value.as_deref().map(|v| vars.expand(v)).transpose();

    let expectation = ResourceExpectation {
        kind: expand_opt(&step.kind)?,
        location: expand_opt(&step.location)?,
        sku: expand_opt(&step.sku)?,
        tier: expand_opt(&step.tier)?,
        size: expand_opt(&step.size)?,
        disks: step
            .disks
            .iter()
            .map(|d| (d.name.clone(), d.size_gb, d.storage_type.clone()))
            .collect(),
    };

    let resource = step_context(ctx, step.timeout_secs)
        .wait_for_resource(&name, |resource| expectation.check(resource))
        .await?;
    ctx.log.line(format!("resource {} matches", resource.name));
    Ok(())
}

async fn expect_absent<P>(
    ctx: &TestContext<P>,
    vars: &mut Variables,
    step: &ExpectAbsentStep,
) -> Result<()>
where
    P: CloudProvider + ?Sized,
{
    let name = vars.expand(&step.name)?;
    step_context(ctx, step.timeout_secs)
        .wait_for_absence(&name)
        .await?;
    ctx.log.line(format!("resource {} is absent", name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalProviderConfig;
    use crate::fixture::{FixtureRunner, FixtureSettings};
    use crate::provider::DiskDescriptor;
    use crate::provider::local::LocalProvider;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn vars() -> Variables {
        Variables::new("rg-abc", "eastus", "backup")
    }

    #[test]
    fn test_expand_builtin_placeholders() {
        let mut vars = vars();
        assert_eq!(
            vars.expand("{namespace}/{location}/{case}").unwrap(),
            "rg-abc/eastus/backup"
        );
        assert_eq!(vars.expand("no placeholders").unwrap(), "no placeholders");
        assert_eq!(vars.expand("{{literal}}").unwrap(), "{literal}");
    }

    #[test]
    fn test_unique_is_stable_per_prefix() {
        let mut vars = vars();
        let first = vars.expand("{unique:vm}").unwrap();
        let second = vars.expand("{unique:vm}").unwrap();
        let other = vars.expand("{unique:disk}").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("vm-"));
    }

    #[test]
    fn test_compact_names() {
        let mut vars = vars();
        let account = vars.expand("{compact:st}").unwrap();
        assert_eq!(account.len(), 2 + names::SUFFIX_LEN);
        assert!(!account.contains('-'));
        assert_eq!(vars.expand("{compact:st}").unwrap(), account);
    }

    #[test]
    fn test_variables() {
        let mut vars = vars();
        assert!(vars.expand("{var:backup}").is_err());
        vars.set("backup", "bk-1");
        assert_eq!(vars.expand("id={var:backup}").unwrap(), "id=bk-1");
    }

    #[test]
    fn test_bad_templates() {
        let mut vars = vars();
        assert!(vars.expand("{nope}").is_err());
        assert!(vars.expand("{namespace").is_err());
        assert!(vars.expand("oops}").is_err());
        assert!(vars.expand("{unique}").is_err());
    }

    #[test]
    fn test_resource_expectation() {
        let resource = ResourceDescriptor {
            name: "vm1".to_string(),
            location: Some("East US".to_string()),
            size: Some("Standard_DS2_v2".to_string()),
            disks: vec![DiskDescriptor {
                name: "data1".to_string(),
                size_gb: Some(50),
                storage_type: Some("Premium_LRS".to_string()),
            }],
            ..Default::default()
        };

        let mut expectation = ResourceExpectation {
            location: Some("eastus".to_string()),
            size: Some("Standard_DS2_v2".to_string()),
            disks: vec![("data1".to_string(), Some(50), Some("Premium_LRS".to_string()))],
            ..Default::default()
        };
        expectation.check(&resource).unwrap();

        expectation.disks = vec![("data1".to_string(), Some(100), None)];
        let err = expectation.check(&resource).unwrap_err();
        assert!(err.to_string().contains("expected 100 GB"));

        expectation.disks.clear();
        expectation.tier = Some("Hot".to_string());
        let err = expectation.check(&resource).unwrap_err();
        assert!(err.to_string().contains("has no tier"));
    }

    fn runner(temp_dir: &TempDir) -> FixtureRunner<LocalProvider> {
        let provider = Arc::new(LocalProvider::new(LocalProviderConfig {
            root: temp_dir.path().join("cloud"),
        }));
        FixtureRunner::new(
            provider,
            FixtureSettings {
                retry: RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(2)),
                teardown: RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(2)),
                log_dir: Some(temp_dir.path().join("logs")),
                name_prefix: "t".to_string(),
                working_dir: None,
                strict_teardown: false,
            },
        )
    }

    fn script(body: &str) -> ScriptStep {
        ScriptStep {
            script: "sh".to_string(),
            args: vec!["-c".to_string(), body.to_string()],
            capture: None,
            expect: None,
            expect_items: None,
            retry: false,
        }
    }

    /// Writes a descriptor into the local provider's namespace. Braces are
    /// doubled because script arguments are templates.
    const CREATE_ACCOUNT: &str = r#"printf '{{"kind":"BlobStorage","sku":"Standard_LRS","tier":"Hot"}}' > "$PROVCHECK_CLOUD_ROOT/$PROVCHECK_NAMESPACE/$0.json""#;

    #[tokio::test]
    async fn test_steps_against_local_provider() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);

        let mut create = script(CREATE_ACCOUNT);
        create.args.push("{compact:st}".to_string());

        let mut list = script(r#"printf '%s\n' b2 b1 > "$0""#);
        list.expect_items = Some(vec!["b1".to_string(), "b2".to_string()]);
        list.capture = Some("backups".to_string());

        let mut echo = script(r#"printf '%s' "$0" > "$1""#);
        echo.args.push("{var:backups}".to_string());
        echo.expect = Some("b2\nb1".to_string());

        let steps = vec![
            StepConfig::Script(create),
            StepConfig::ExpectResource(ExpectResourceStep {
                name: "{compact:st}".to_string(),
                kind: Some("BlobStorage".to_string()),
                sku: Some("Standard_LRS".to_string()),
                tier: Some("Hot".to_string()),
                ..Default::default()
            }),
            StepConfig::Script(list),
            StepConfig::Script(echo),
            StepConfig::ExpectAbsent(ExpectAbsentStep {
                name: "{unique:ghost}".to_string(),
                timeout_secs: None,
            }),
        ];

        let report = runner
            .run("steps", Duration::from_secs(30), "eastus", move |ctx| {
                run_steps(ctx, steps)
            })
            .await;

        report.assert_passed();
        assert!(!temp_dir.path().join("cloud").join(&report.namespace.unwrap().name).exists());
    }

    #[tokio::test]
    async fn test_mismatch_fails_after_retrying() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);

        let mut create = script(CREATE_ACCOUNT);
        create.args.push("acct".to_string());

        let steps = vec![
            StepConfig::Script(create),
            StepConfig::ExpectResource(ExpectResourceStep {
                name: "acct".to_string(),
                tier: Some("Cool".to_string()),
                timeout_secs: Some(0),
                ..Default::default()
            }),
        ];

        let report = runner
            .run("mismatch", Duration::from_secs(30), "eastus", move |ctx| {
                run_steps(ctx, steps)
            })
            .await;

        let cause = report.cause().unwrap();
        assert!(cause.contains("step 2"));
        assert!(cause.contains("tier: expected Cool, got Hot"));
    }

    #[tokio::test]
    async fn test_retried_script_converges() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let marker = temp_dir.path().join("attempts");

        // Fails until the third attempt.
        let body = format!(
            r#"echo x >> {m}; test "$(wc -l < {m})" -ge 3 || exit 1; printf ok > "$0""#,
            m = marker.display()
        );
        let mut step = script(&body);
        step.retry = true;
        step.expect = Some("ok".to_string());

        let report = runner
            .run("converges", Duration::from_secs(30), "eastus", move |ctx| {
                run_steps(ctx, vec![StepConfig::Script(step)])
            })
            .await;

        report.assert_passed();
        let attempts = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(attempts.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_failing_script_stops_steps() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(&temp_dir);
        let marker = temp_dir.path().join("second-ran");

        let steps = vec![
            StepConfig::Script(script("echo nope >&2; exit 4")),
            StepConfig::Script(script(&format!("touch {}", marker.display()))),
        ];

        let report = runner
            .run("stops", Duration::from_secs(30), "eastus", move |ctx| {
                run_steps(ctx, steps)
            })
            .await;

        assert!(report.cause().unwrap().contains("step 1"));
        assert!(!marker.exists());
    }
}
