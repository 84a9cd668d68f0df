//! Per-case lifecycle: allocate a namespace, run the body, always tear down.
//!
//! ```text
//! Created ──► Provisioning ──► Running ──► TearingDown ──► Passed
//!                  │              │             │
//!                  └──────────────┴─────────────┴────────► Failed
//! ```
//!
//! The body runs on its own task and is raced against the case deadline and
//! the cancellation token. Whatever happens to it (error, panic, timeout,
//! cancellation) the namespace is deleted afterwards, under its own retry
//! budget that is independent of the case deadline. Dropping the future
//! returned by [`FixtureRunner::run`] aborts the body and deletes the
//! namespace from a background task.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use provcheck::config::LocalProviderConfig;
//! use provcheck::fixture::{FixtureRunner, FixtureSettings};
//! use provcheck::provider::local::LocalProvider;
//!
//! # async fn example() {
//! let provider = Arc::new(LocalProvider::new(LocalProviderConfig::default()));
//! let runner = FixtureRunner::new(provider, FixtureSettings::default());
//!
//! let report = runner
//!     .run("storage-create", Duration::from_secs(600), "eastus", |ctx| async move {
//!         let id = ctx
//!             .scripts
//!             .run_capturing_output("./testdata/create_storage.sh", [ctx.namespace()])
//!             .await?;
//!         ctx.wait_for_resource(&id, |account| {
//!             anyhow::ensure!(account.require_sku()? == "Standard_LRS");
//!             Ok(())
//!         })
//!         .await?;
//!         Ok(())
//!     })
//!     .await;
//!
//! report.assert_passed();
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::log::CaseLog;
use crate::names;
use crate::provider::{CloudProvider, Namespace, ProviderError, ResourceDescriptor};
use crate::retry::{RetryError, RetryPolicy, Retrier};
use crate::script::ScriptRunner;

/// Environment variable holding the case namespace for scripts.
pub const NAMESPACE_ENV: &str = "PROVCHECK_NAMESPACE";

/// Environment variable holding the case location for scripts.
pub const LOCATION_ENV: &str = "PROVCHECK_LOCATION";

/// Longest case-name fragment used in namespace names.
const MAX_SLUG_LEN: usize = 40;

/// Settings shared by every case a runner executes.
#[derive(Debug, Clone)]
pub struct FixtureSettings {
    /// Default policy of the per-case retrier.
    pub retry: RetryPolicy,

    /// Policy for deleting the namespace.
    pub teardown: RetryPolicy,

    /// Where case logs go. `None` logs through `tracing` only.
    pub log_dir: Option<PathBuf>,

    pub name_prefix: String,

    /// Working directory for scripts.
    pub working_dir: Option<PathBuf>,

    /// Fail passing cases whose namespace could not be deleted.
    pub strict_teardown: bool,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl FixtureSettings {
    pub fn from_config(harness: &HarnessConfig) -> Self {
        Self {
            retry: harness.retry_policy(),
            teardown: harness.teardown_policy(),
            log_dir: Some(harness.log_dir.clone()),
            name_prefix: harness.name_prefix.clone(),
            working_dir: harness.working_dir.clone(),
            strict_teardown: harness.strict_teardown,
        }
    }
}

/// Lifecycle phase of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePhase {
    Provisioning,
    Running,
    TearingDown,
}

impl fmt::Display for CasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CasePhase::Provisioning => write!(f, "provisioning"),
            CasePhase::Running => write!(f, "running"),
            CasePhase::TearingDown => write!(f, "teardown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseState {
    Created,
    Provisioning,
    Running,
    TearingDown,
    Passed,
    Failed,
}

/// Verdict of a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed { phase: CasePhase, cause: String },
    /// The case never started, e.g. the suite was cancelled first.
    NotRun { reason: String },
}

/// Everything known about a finished case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub namespace: Option<Namespace>,
    pub outcome: CaseOutcome,

    /// Set when the namespace could not be deleted.
    pub teardown_error: Option<String>,

    pub duration: Duration,
    pub log_path: Option<PathBuf>,
}

impl CaseReport {
    /// A report for a case that was skipped before provisioning.
    pub fn not_run(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            outcome: CaseOutcome::NotRun {
                reason: reason.into(),
            },
            teardown_error: None,
            duration: Duration::ZERO,
            log_path: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == CaseOutcome::Passed
    }

    /// Whether the namespace may still exist.
    pub fn leaked(&self) -> bool {
        self.teardown_error.is_some()
    }

    /// Failure cause, if the case did not pass.
    pub fn cause(&self) -> Option<&str> {
        match &self.outcome {
            CaseOutcome::Passed => None,
            CaseOutcome::Failed { cause, .. } => Some(cause),
            CaseOutcome::NotRun { reason } => Some(reason),
        }
    }

    /// Converts a failed report into an error.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self.outcome {
            CaseOutcome::Passed => Ok(()),
            CaseOutcome::Failed { phase, cause } => {
                Err(anyhow::anyhow!("{} failed during {}: {}", self.name, phase, cause))
            }
            CaseOutcome::NotRun { reason } => {
                Err(anyhow::anyhow!("{} did not run: {}", self.name, reason))
            }
        }
    }

    /// Panics unless the case passed.
    ///
    /// Meant for `#[tokio::test]` functions: teardown has already happened
    /// by the time this panics.
    #[track_caller]
    pub fn assert_passed(&self) {
        if let Some(cause) = self.cause() {
            panic!("case {} failed: {}", self.name, cause);
        }
    }
}

/// What a case body gets to work with.
///
/// One per case; clones share the log, the provider and the cancellation
/// token.
pub struct TestContext<P: ?Sized> {
    pub namespace: Namespace,
    pub retrier: Retrier,
    pub scripts: ScriptRunner,
    pub log: CaseLog,
    pub provider: Arc<P>,
}

impl<P: ?Sized> Clone for TestContext<P> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            retrier: self.retrier.clone(),
            scripts: self.scripts.clone(),
            log: self.log.clone(),
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: CloudProvider + ?Sized> TestContext<P> {
    pub fn namespace(&self) -> &str {
        &self.namespace.name
    }

    pub fn location(&self) -> &str {
        &self.namespace.location
    }

    /// A copy whose retrier uses `timeout` instead of the default budget.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut ctx = self.clone();
        ctx.retrier = self.retrier.with_timeout(timeout);
        ctx
    }

    /// Polls until `name` exists and passes `check`.
    pub async fn wait_for_resource<C>(
        &self,
        name: &str,
        check: C,
    ) -> Result<ResourceDescriptor, RetryError>
    where
        C: Fn(&ResourceDescriptor) -> anyhow::Result<()>,
    {
        let provider = &self.provider;
        let namespace = self.namespace();
        let check = &check;
        self.retrier
            .run(&format!("Resource.AssertExists:{}", name), move || async move {
                let resource = provider.get_resource(namespace, name).await?;
                check(&resource)?;
                Ok::<_, anyhow::Error>(resource)
            })
            .await
    }

    /// Polls until `name` no longer exists.
    pub async fn wait_for_absence(&self, name: &str) -> Result<(), RetryError> {
        let provider = &self.provider;
        let namespace = self.namespace();
        self.retrier
            .run_until_absent(&format!("Resource.AssertAbsent:{}", name), move || {
                provider.get_resource(namespace, name)
            })
            .await
    }
}

enum BodyEnd {
    Joined(Result<anyhow::Result<()>, JoinError>),
    TimedOut,
    Cancelled,
}

/// Runs cases against one provider.
pub struct FixtureRunner<P: ?Sized> {
    provider: Arc<P>,
    settings: FixtureSettings,
    cancel: CancellationToken,
}

impl<P> FixtureRunner<P>
where
    P: CloudProvider + ?Sized + 'static,
{
    pub fn new(provider: Arc<P>, settings: FixtureSettings) -> Self {
        Self {
            provider,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops running bodies; teardown still happens.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn settings(&self) -> &FixtureSettings {
        &self.settings
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs one case and returns its report.
    ///
    /// Never panics because of the body: panics are captured and reported
    /// as failures after the namespace is gone.
    pub async fn run<F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        location: &str,
        body: F,
    ) -> CaseReport
    where
        F: FnOnce(TestContext<P>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let started = std::time::Instant::now();
        let deadline = Instant::now() + timeout;
        let case_token = self.cancel.child_token();
        let log = self.open_log(name);
        let mut state = CaseState::Created;

        let slug: String = names::sanitize(name).chars().take(MAX_SLUG_LEN).collect();
        let namespace_name = names::unique_name(&format!("{}-{}", self.settings.name_prefix, slug));

        info!(case = name, namespace = %namespace_name, location, "Starting case");
        let mut guard = TeardownGuard {
            provider: Arc::clone(&self.provider),
            policy: self.settings.teardown,
            log: log.clone(),
            namespace: namespace_name.clone(),
            case_token: case_token.clone(),
            body: None,
            armed: true,
        };
        transition(&log, &mut state, CaseState::Provisioning);

        let created = tokio::select! {
            biased;
            _ = case_token.cancelled() => Err(anyhow::anyhow!("cancelled during provisioning")),
            _ = tokio::time::sleep_until(deadline) => {
                Err(anyhow::anyhow!("timed out after {:?} during provisioning", timeout))
            }
            result = self.provider.create_namespace(&namespace_name, location) => {
                result.map_err(anyhow::Error::from)
            }
        };

        let (namespace, mut outcome) = match created {
            Ok(namespace) => {
                log.line(format!(
                    "namespace {} created in {}",
                    namespace.name, namespace.location
                ));
                transition(&log, &mut state, CaseState::Running);
                let outcome = self
                    .run_body(
                        namespace.clone(),
                        &log,
                        deadline,
                        timeout,
                        &case_token,
                        &mut guard,
                        body,
                    )
                    .await;
                (Some(namespace), outcome)
            }
            Err(e) => {
                let cause = format!("{:#}", e);
                warn!(case = name, "Provisioning failed: {}", cause);
                log.line(format!("provisioning failed: {}", cause));
                (
                    None,
                    CaseOutcome::Failed {
                        phase: CasePhase::Provisioning,
                        cause,
                    },
                )
            }
        };

        // Cleans up anything a cancelled or partially failed create left behind.
        case_token.cancel();
        transition(&log, &mut state, CaseState::TearingDown);
        let teardown_result = self.teardown(&log, &namespace_name).await;
        guard.disarm();
        let teardown_error = match teardown_result {
            Ok(()) => None,
            Err(e) => {
                let msg = format!("{:#}", e);
                warn!(case = name, namespace = %namespace_name, "Teardown failed: {}", msg);
                log.line(format!("teardown failed, namespace may be leaked: {}", msg));
                Some(msg)
            }
        };

        if self.settings.strict_teardown
            && outcome == CaseOutcome::Passed
            && let Some(err) = &teardown_error
        {
            outcome = CaseOutcome::Failed {
                phase: CasePhase::TearingDown,
                cause: err.clone(),
            };
        }

        let final_state = if outcome == CaseOutcome::Passed {
            CaseState::Passed
        } else {
            CaseState::Failed
        };
        transition(&log, &mut state, final_state);

        let duration = started.elapsed();
        match &outcome {
            CaseOutcome::Passed => info!(case = name, ?duration, "Case passed"),
            _ => warn!(case = name, ?duration, "Case failed"),
        }

        CaseReport {
            name: name.to_string(),
            namespace,
            outcome,
            teardown_error,
            duration,
            log_path: log.path().map(|p| p.to_path_buf()),
        }
    }

    fn open_log(&self, name: &str) -> CaseLog {
        match &self.settings.log_dir {
            Some(dir) => CaseLog::create(dir, name).unwrap_or_else(|e| {
                warn!(case = name, "Falling back to tracing-only case log: {:#}", e);
                CaseLog::discard(name)
            }),
            None => CaseLog::discard(name),
        }
    }

    async fn run_body<F, Fut>(
        &self,
        namespace: Namespace,
        log: &CaseLog,
        deadline: Instant,
        timeout: Duration,
        case_token: &CancellationToken,
        guard: &mut TeardownGuard<P>,
        body: F,
    ) -> CaseOutcome
    where
        F: FnOnce(TestContext<P>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let retrier = Retrier::new(self.settings.retry, log.clone())
            .with_deadline(deadline)
            .with_cancellation(case_token.clone());

        let mut scripts = ScriptRunner::new(log.clone())
            .with_cancellation(case_token.clone())
            .env(NAMESPACE_ENV, namespace.name.clone())
            .env(LOCATION_ENV, namespace.location.clone())
            .envs(self.provider.script_env());
        if let Some(dir) = &self.settings.working_dir {
            scripts = scripts.with_working_dir(dir.clone());
        }

        let ctx = TestContext {
            namespace,
            retrier,
            scripts,
            log: log.clone(),
            provider: Arc::clone(&self.provider),
        };

        let mut handle = tokio::spawn(body(ctx));
        guard.body = Some(handle.abort_handle());
        let end = tokio::select! {
            biased;
            joined = &mut handle => BodyEnd::Joined(joined),
            _ = case_token.cancelled() => BodyEnd::Cancelled,
            _ = tokio::time::sleep_until(deadline) => BodyEnd::TimedOut,
        };

        let cause = match end {
            BodyEnd::Joined(Ok(Ok(()))) => return CaseOutcome::Passed,
            BodyEnd::Joined(Ok(Err(e))) => format!("{:#}", e),
            BodyEnd::Joined(Err(e)) if e.is_panic() => {
                format!("test body panicked: {}", panic_message(e.into_panic()))
            }
            BodyEnd::Joined(Err(e)) => format!("test body aborted: {}", e),
            BodyEnd::TimedOut => {
                stop(case_token, handle).await;
                format!("timed out after {:?}", timeout)
            }
            BodyEnd::Cancelled => {
                stop(case_token, handle).await;
                "cancelled".to_string()
            }
        };

        log.line(format!("body failed: {}", cause));
        CaseOutcome::Failed {
            phase: CasePhase::Running,
            cause,
        }
    }

    async fn teardown(&self, log: &CaseLog, namespace: &str) -> Result<(), RetryError> {
        delete_namespace(&*self.provider, self.settings.teardown, log, namespace).await
    }
}

/// Deletes `namespace`, treating an already missing namespace as deleted.
async fn delete_namespace<P>(
    provider: &P,
    policy: RetryPolicy,
    log: &CaseLog,
    namespace: &str,
) -> Result<(), RetryError>
where
    P: CloudProvider + ?Sized,
{
    let retrier = Retrier::new(policy, log.clone());
    retrier
        .run(&format!("Namespace.Delete:{}", namespace), move || async move {
            match provider.delete_namespace(namespace).await {
                Ok(()) => Ok(()),
                Err(ProviderError::NotFound(_)) => {
                    debug!(namespace, "Namespace already gone");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await?;
    log.line(format!("namespace {} deleted", namespace));
    Ok(())
}

/// Tears the namespace down from a background task when [`FixtureRunner::run`]
/// is dropped before its own teardown finished.
///
/// Dropping also cancels the case token and aborts the body task.
struct TeardownGuard<P: CloudProvider + ?Sized + 'static> {
    provider: Arc<P>,
    policy: RetryPolicy,
    log: CaseLog,
    namespace: String,
    case_token: CancellationToken,
    body: Option<AbortHandle>,
    armed: bool,
}

impl<P: CloudProvider + ?Sized + 'static> TeardownGuard<P> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<P: CloudProvider + ?Sized + 'static> Drop for TeardownGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.case_token.cancel();
        if let Some(body) = self.body.take() {
            body.abort();
        }

        let namespace = std::mem::take(&mut self.namespace);
        warn!(
            case = %self.log.case(),
            namespace = %namespace,
            "Case dropped before teardown, deleting namespace in the background"
        );
        self.log
            .line("case dropped before teardown, deleting namespace in the background");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(namespace = %namespace, "No runtime left for teardown, namespace may be leaked");
            return;
        };

        let provider = Arc::clone(&self.provider);
        let policy = self.policy;
        let log = self.log.clone();
        runtime.spawn(async move {
            if let Err(e) = delete_namespace(&*provider, policy, &log, &namespace).await {
                warn!(namespace = %namespace, "Background teardown failed: {:#}", e);
                log.line(format!("teardown failed, namespace may be leaked: {:#}", e));
            }
        });
    }
}

/// Cancels the body's token and waits for its task to go away.
async fn stop(token: &CancellationToken, handle: tokio::task::JoinHandle<anyhow::Result<()>>) {
    token.cancel();
    handle.abort();
    let _ = handle.await;
}

fn transition(log: &CaseLog, state: &mut CaseState, next: CaseState) {
    debug!(case = %log.case(), from = ?*state, to = ?next, "Case state change");
    log.line(format!("state {:?} -> {:?}", state, next));
    *state = next;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
