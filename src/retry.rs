//! Fixed-interval retry engine for eventually consistent remote state.
//!
//! Provisioning actions return before the provider's read API reflects them,
//! so every check against the provider is wrapped in [`Retrier::run`]: the
//! operation is attempted, and on failure attempted again after a fixed poll
//! interval, until it succeeds or the deadline passes. The engine does not
//! distinguish "not created yet" from "will never exist"; a wrong assumption
//! about propagation delay shows up as a [`RetryError::DeadlineExceeded`]
//! carrying the last observed error.
//!
//! # Deadlines
//!
//! A retrier has a nominal timeout ([`RetryPolicy::timeout`]) and, when it
//! belongs to a test case, the case deadline. The effective deadline of a
//! single [`Retrier::run`] call is the earlier of the two, so a retrier can
//! never poll past the time budget of the case that owns it.
//!
//! # Cancellation
//!
//! Waits between attempts (and attempts after the first) race the retrier's
//! [`CancellationToken`]. Cancelling the suite token stops every pending poll
//! promptly.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use provcheck::log::CaseLog;
//! use provcheck::retry::{Retrier, RetryPolicy};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let retrier = Retrier::new(
//!     RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
//!     CaseLog::discard("example"),
//! );
//!
//! let size = retrier
//!     .run("VM.AssertExists:web-1", || async {
//!         // Query the provider here; any error means "try again".
//!         Ok::<_, anyhow::Error>("Standard_DS1_v2".to_string())
//!     })
//!     .await?;
//! assert_eq!(size, "Standard_DS1_v2");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::log::CaseLog;
use crate::provider::{ProviderError, ProviderResult};

/// Polling configuration for a retrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed wait between two attempts.
    pub poll_interval: Duration,

    /// Maximum total duration of one [`Retrier::run`] call.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Errors returned by [`Retrier::run`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The deadline passed before the operation succeeded.
    ///
    /// `source` is the error of the last attempt.
    #[error("{operation}: gave up after {attempts} attempt(s) in {elapsed:?}: {source:#}")]
    DeadlineExceeded {
        operation: String,
        attempts: usize,
        elapsed: Duration,
        #[source]
        source: anyhow::Error,
    },

    /// The operation reported an error marked with [`fatal`].
    #[error("{operation}: non-retryable failure on attempt {attempts}: {source:#}")]
    Fatal {
        operation: String,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The case or suite was cancelled while retrying.
    #[error("{operation}: cancelled after {attempts} attempt(s) in {elapsed:?}")]
    Cancelled {
        operation: String,
        attempts: usize,
        elapsed: Duration,
        last_error: Option<String>,
    },
}

impl RetryError {
    /// The operation id the error is attributed to.
    pub fn operation(&self) -> &str {
        match self {
            RetryError::DeadlineExceeded { operation, .. }
            | RetryError::Fatal { operation, .. }
            | RetryError::Cancelled { operation, .. } => operation,
        }
    }

    /// Number of attempts performed before giving up.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Marker for attempt errors that must not be retried.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Fatal(anyhow::Error);

/// Wraps an error so that [`Retrier::run`] stops retrying immediately.
///
/// ```
/// use provcheck::retry::fatal;
///
/// let err = fatal(anyhow::anyhow!("credentials rejected"));
/// assert_eq!(err.to_string(), "credentials rejected");
/// ```
pub fn fatal(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(Fatal(err.into()))
}

/// Retries fallible operations at a fixed interval until success or deadline.
///
/// Cloning is cheap; clones share the cancellation token and the log sink.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    case_deadline: Option<Instant>,
    cancel: CancellationToken,
    log: CaseLog,
}

enum Step<T> {
    Done(T),
    Cancelled,
    Overran,
}

impl Retrier {
    /// Creates a retrier with no case deadline and its own cancellation token.
    pub fn new(policy: RetryPolicy, log: CaseLog) -> Self {
        Self {
            policy,
            case_deadline: None,
            cancel: CancellationToken::new(),
            log,
        }
    }

    /// Binds the retrier to an absolute case deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.case_deadline = Some(deadline);
        self
    }

    /// Uses `token` to interrupt waits.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derives a retrier with a different nominal timeout.
    ///
    /// The case deadline, if any, still caps the effective deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut retrier = self.clone();
        retrier.policy.timeout = timeout;
        retrier
    }

    /// Derives a retrier with a different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        let mut retrier = self.clone();
        retrier.policy = policy;
        retrier
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The case deadline this retrier inherits, if any.
    pub fn case_deadline(&self) -> Option<Instant> {
        self.case_deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the case deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.case_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline_from(&self, start: Instant) -> Instant {
        let nominal = start + self.policy.timeout;
        match self.case_deadline {
            Some(case_deadline) => nominal.min(case_deadline),
            None => nominal,
        }
    }

    /// Runs `op` until it succeeds or the effective deadline passes.
    ///
    /// `op` is always invoked at least once, even when the deadline has
    /// already passed. An attempt still running at the deadline is dropped. Each failed attempt is logged with `operation` so
    /// failures stay attributable in long runs. Panics in `op` propagate.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let start = Instant::now();
        let deadline = self.deadline_from(start);
        // A deadline that has already passed still gets one unbounded attempt.
        let bounded = deadline > start;
        let mut attempts = 0usize;
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            attempts += 1;

            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                result = op() => Step::Done(result),
                _ = tokio::time::sleep_until(deadline), if bounded || attempts > 1 => Step::Overran,
            };

            let err = match step {
                Step::Done(Ok(value)) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "Operation succeeded after retrying");
                        self.log
                            .line(format!("{}: succeeded on attempt {}", operation, attempts));
                    }
                    return Ok(value);
                }
                Step::Done(Err(err)) => err.into(),
                Step::Cancelled => {
                    return Err(self.cancelled(operation, attempts, start, last_error));
                }
                Step::Overran => {
                    let source = last_error.unwrap_or_else(|| {
                        anyhow::anyhow!("attempt {} overran the deadline", attempts)
                    });
                    return Err(self.exceeded(operation, attempts, start, source));
                }
            };

            let err = match err.downcast::<Fatal>() {
                Ok(Fatal(source)) => {
                    warn!(operation, attempts, error = %format!("{:#}", source), "Operation failed fatally");
                    self.log.line(format!(
                        "{}: attempt {} failed fatally: {:#}",
                        operation, attempts, source
                    ));
                    return Err(RetryError::Fatal {
                        operation: operation.to_string(),
                        attempts,
                        source,
                    });
                }
                Err(err) => err,
            };

            warn!(operation, attempts, error = %format!("{:#}", err), "Attempt failed");
            self.log
                .line(format!("{}: attempt {} failed: {:#}", operation, attempts, err));

            let now = Instant::now();
            if now >= deadline {
                return Err(self.exceeded(operation, attempts, start, err));
            }
            last_error = Some(err);

            let wake = (now + self.policy.poll_interval).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(self.cancelled(operation, attempts, start, last_error));
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Polls `lookup` until it reports [`ProviderError::NotFound`].
    ///
    /// Any other error, or a successful lookup, counts as a failed attempt.
    pub async fn run_until_absent<T, F, Fut>(
        &self,
        operation: &str,
        mut lookup: F,
    ) -> Result<(), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.run(operation, || {
            let pending = lookup();
            async move {
                match pending.await {
                    Err(ProviderError::NotFound(_)) => Ok(()),
                    Err(e) => Err(anyhow::Error::from(e)),
                    Ok(_) => Err(anyhow::anyhow!("resource still exists")),
                }
            }
        })
        .await
    }

    fn exceeded(
        &self,
        operation: &str,
        attempts: usize,
        start: Instant,
        source: anyhow::Error,
    ) -> RetryError {
        let elapsed = start.elapsed();
        self.log.line(format!(
            "{}: giving up after {} attempt(s) in {:?}",
            operation, attempts, elapsed
        ));
        RetryError::DeadlineExceeded {
            operation: operation.to_string(),
            attempts,
            elapsed,
            source,
        }
    }

    fn cancelled(
        &self,
        operation: &str,
        attempts: usize,
        start: Instant,
        last_error: Option<anyhow::Error>,
    ) -> RetryError {
        self.log.line(format!("{}: cancelled", operation));
        RetryError::Cancelled {
            operation: operation.to_string(),
            attempts,
            elapsed: start.elapsed(),
            last_error: last_error.map(|e| format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn retrier(interval_ms: u64, timeout_ms: u64) -> Retrier {
        Retrier::new(
            RetryPolicy::new(
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
            ),
            CaseLog::discard("retry-test"),
        )
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let calls = AtomicUsize::new(0);
        let result = retrier(10, 1000)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retrier(10, 5000)
            .run("op", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(anyhow::anyhow!("not yet"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let start = std::time::Instant::now();

        let err = retrier(50, 200)
            .run("Storage.AssertExists:acct", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(anyhow::anyhow!("attempt {}", n)) }
            })
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200 + 50 + 200), "{:?}", elapsed);

        let attempts = calls.load(Ordering::SeqCst);
        assert!(attempts >= 2);
        assert_eq!(err.attempts(), attempts);
        assert_eq!(err.operation(), "Storage.AssertExists:acct");
        match err {
            RetryError::DeadlineExceeded { source, .. } => {
                assert_eq!(source.to_string(), format!("attempt {}", attempts));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_timeout_still_attempts_once() {
        let calls = AtomicUsize::new(0);
        let err = retrier(10, 0)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("nope")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::DeadlineExceeded { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_past_case_deadline_still_attempts_once() {
        let retrier = retrier(10, 60_000).with_deadline(Instant::now());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = retrier
            .run("op", || async { Ok::<_, anyhow::Error>("done") })
            .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_case_deadline_caps_nominal_timeout() {
        let retrier = retrier(50, 60_000)
            .with_deadline(Instant::now() + Duration::from_millis(200))
            .with_timeout(Duration::from_secs(30));
        let start = std::time::Instant::now();

        let err = retrier
            .run("op", || async { Err::<(), _>(anyhow::anyhow!("never")) })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::DeadlineExceeded { .. }));
        assert!(start.elapsed() < Duration::from_millis(200 + 50 + 200));
    }

    #[tokio::test]
    async fn test_fatal_stops_retrying() {
        let calls = AtomicUsize::new(0);
        let err = retrier(10, 5000)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(fatal(anyhow::anyhow!("bad credentials"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            RetryError::Fatal { source, .. } => assert_eq!(source.to_string(), "bad credentials"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let token = CancellationToken::new();
        let retrier = retrier(60_000, 120_000).with_cancellation(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let err = retrier
            .run("op", || async { Err::<(), _>(anyhow::anyhow!("pending")) })
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            RetryError::Cancelled { last_error, .. } => {
                assert_eq!(last_error.as_deref(), Some("pending"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_attempt_is_cut_at_deadline() {
        let calls = AtomicUsize::new(0);
        let start = std::time::Instant::now();

        let err = retrier(10, 150)
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n > 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Err::<(), _>(anyhow::anyhow!("first"))
                }
            })
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            RetryError::DeadlineExceeded { source, .. } => assert_eq!(source.to_string(), "first"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_hung_first_attempt_is_cut_at_deadline() {
        let start = std::time::Instant::now();

        let err = retrier(10, 150)
            .run("Script.Run:./create.sh", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            RetryError::DeadlineExceeded { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert!(source.to_string().contains("overran the deadline"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_run_until_absent() {
        let calls = AtomicUsize::new(0);
        let result = retrier(10, 5000)
            .run_until_absent("Storage.AssertGone:acct", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok("still here")
                    } else {
                        Err(ProviderError::NotFound("acct".to_string()))
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_display_carries_operation() {
        let err = RetryError::DeadlineExceeded {
            operation: "VM.AssertExists:vm1".to_string(),
            attempts: 4,
            elapsed: Duration::from_secs(2),
            source: anyhow::anyhow!("not found"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("VM.AssertExists:vm1: gave up after 4 attempt(s)"));
        assert!(msg.ends_with("not found"));
    }
}
