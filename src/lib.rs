//! provcheck: end-to-end harness for infrastructure-provisioning scripts.
//!
//! Each case gets a freshly created, uniquely named namespace (a resource
//! group, a project, a directory for the local simulator). The case body
//! runs provisioning scripts against it and polls the provider until the
//! resulting resources look as expected. The namespace is deleted on every
//! exit path.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Provider**: Create/delete namespaces and describe resources (local, script)
//! - **Script**: Run external scripts and recover their output through a temp file
//! - **Retry**: Poll eventually-consistent operations within a time budget
//! - **Fixture**: Per-case namespace lifecycle with guaranteed teardown
//! - **Suite**: Run configured cases concurrently
//! - **Report**: Console progress and JUnit XML
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
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = Arc::new(LocalProvider::new(LocalProviderConfig::default()));
//!     let runner = FixtureRunner::new(provider, FixtureSettings::default());
//!
//!     let report = runner
//!         .run("backup", Duration::from_secs(600), "eastus", |ctx| async move {
//!             ctx.scripts
//!                 .run("./create_vault.sh", [ctx.namespace(), ctx.location()])
//!                 .await?;
//!             ctx.wait_for_resource("vault", |_| Ok(())).await?;
//!             Ok(())
//!         })
//!         .await;
//!
//!     report.into_result()
//! }
//! ```

pub mod config;
pub mod fixture;
pub mod log;
pub mod names;
pub mod provider;
pub mod report;
pub mod retry;
pub mod script;
pub mod steps;
pub mod suite;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use fixture::{CaseOutcome, CaseReport, FixtureRunner, TestContext};
pub use provider::{CloudProvider, Namespace, ProviderError, ResourceDescriptor};
pub use report::Reporter;
pub use retry::{Retrier, RetryError, RetryPolicy};
pub use script::{ScriptError, ScriptRunner};
pub use suite::{Suite, SuiteResult};
