//! provcheck CLI - end-to-end checks for provisioning scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use provcheck::config::{self, ProviderConfig};
use provcheck::names;
use provcheck::provider::{CloudProvider, local::LocalProvider, script::ScriptProvider};
use provcheck::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use provcheck::suite::Suite;

#[derive(Parser)]
#[command(name = "provcheck")]
#[command(about = "End-to-end checks for infrastructure-provisioning scripts", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "provcheck.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured cases
    Run {
        /// Override maximum parallel cases
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Only run cases whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Provider type (local, script)
        #[arg(short, long, default_value = "local")]
        provider: String,
    },

    /// Print unique resource names
    Names {
        /// Name prefix
        prefix: String,

        /// How many names to print
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Print compact names (no separators) of at most this length
        #[arg(long)]
        compact: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let log_level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match cli.command {
        Commands::Run {
            parallel,
            filter,
            junit,
        } => run_cases(&cli.config, parallel, filter, junit, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { provider } => init_config(&cli.config, &provider),
        Commands::Names {
            prefix,
            count,
            compact,
        } => {
            print_names(&prefix, count, compact);
            Ok(())
        }
    }
}

async fn run_cases(
    config_path: &Path,
    parallel_override: Option<usize>,
    filter: Option<String>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config::ensure_valid(&config)?;

    info!("Loaded configuration from {}", config_path.display());

    match &config.provider {
        ProviderConfig::Local(p_cfg) => {
            let provider = Arc::new(LocalProvider::new(p_cfg.clone()));
            run_with(&config, provider, parallel_override, filter, junit_path, verbose).await
        }
        ProviderConfig::Script(p_cfg) => {
            let provider = Arc::new(ScriptProvider::new(p_cfg.clone()));
            run_with(&config, provider, parallel_override, filter, junit_path, verbose).await
        }
    }
}

async fn run_with<P>(
    config: &config::Config,
    provider: Arc<P>,
    parallel_override: Option<usize>,
    filter: Option<String>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()>
where
    P: CloudProvider + 'static,
{
    info!("Using provider: {}", provider.name());

    let reporter = create_reporter(config, provider.name(), junit_path, verbose);
    let token = CancellationToken::new();
    watch_ctrl_c(token.clone());

    let mut suite = Suite::new(config, provider, reporter).with_cancellation(token);
    if let Some(parallel) = parallel_override {
        suite = suite.with_max_parallel(parallel);
    }

    let selected = suite.selected(filter.as_deref()).len();
    if selected == 0 {
        bail!("No cases selected");
    }

    let result = suite.run(filter.as_deref()).await;
    std::process::exit(result.exit_code());
}

/// First Ctrl-C cancels running cases and lets teardown finish; a second one
/// exits immediately.
fn watch_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, tearing down namespaces (press Ctrl-C again to abort)");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Aborted, namespaces may be leaked");
            std::process::exit(130);
        }
    });
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let problems = config::validate(&config);
    if !problems.is_empty() {
        eprintln!("Configuration error:");
        for problem in &problems {
            eprintln!("  {}", problem);
        }
        std::process::exit(1);
    }

    let harness = &config.harness;
    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Location: {}", harness.location);
    println!("  Max parallel: {}", harness.max_parallel);
    println!("  Case timeout: {}s", harness.case_timeout_secs);
    println!("  Poll interval: {}s", harness.poll_interval_secs);
    println!("  Retry timeout: {}s", harness.retry_timeout_secs);
    println!("  Provider: {}", config.provider.kind());
    println!("  Cases: {}", config.cases.len());
    for case in &config.cases {
        println!("    {} ({} steps)", case.name, case.steps.len());
    }

    Ok(())
}

fn init_config(path: &Path, provider: &str) -> Result<()> {
    let provider_config = match provider {
        "local" => {
            r#"[provider]
type = "local"
root = ".provcheck/cloud""#
        }
        "script" => {
            r#"[provider]
type = "script"
create_command = "az group create --name {namespace} --location {location}"
delete_command = "az group delete --name {namespace} --yes"
get_command = "./scripts/describe.sh {namespace} {name}"
not_found_exit_code = 3

[provider.env]
AZURE_SUBSCRIPTION_ID = "$AZURE_SUBSCRIPTION_ID""#
        }
        _ => {
            eprintln!("Unknown provider: {}. Use: local, script", provider);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# provcheck configuration file

[harness]
location = "eastus"
max_parallel = 4
case_timeout_secs = 900
poll_interval_secs = 5
retry_timeout_secs = 300
log_dir = "testdata/logs"

{}

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"

[[cases]]
name = "smoke"

[[cases.steps]]
type = "script"
script = "sh"
args = ["-c", "printf '%s' \"$PROVCHECK_NAMESPACE\" > \"$0\""]
expect = "{{namespace}}"

[[cases.steps]]
type = "expect_absent"
name = "nothing-here"
timeout_secs = 10
"#,
        provider_config
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  provcheck run");

    Ok(())
}

fn print_names(prefix: &str, count: usize, compact: Option<usize>) {
    for _ in 0..count {
        let name = match compact {
            Some(len) => names::compact_unique_name(prefix, len),
            None => names::unique_name(prefix),
        };
        println!("{}", name);
    }
}

fn create_reporter(
    config: &config::Config,
    provider_name: &str,
    junit_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(
            JUnitReporter::new(junit_path).with_classname(format!("provcheck.{}", provider_name)),
        );
    }

    multi
}
