//! paprep - Prepare factory-default PAN-OS firewalls
//!
//! Applies the initial management configuration over SSH, then steps the
//! device through the upgrade ladder to the requested PAN-OS version.

mod config;
mod provision;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use paprep_core::{resolve, Ladder, PathError, ValidatedSetup, Version};
use paprep_ssh::{Credentials, DeviceSession, Endpoint, SessionError, ShellTransport};
use paprep_upgrade::{OrchestrationResult, Orchestrator, ProgressEvent, RunError, RunReport, StepFailure};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "paprep")]
#[command(about = "Initial configuration and stepped upgrades for PAN-OS firewalls")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "paprep.toml")]
    config: PathBuf,

    /// New management IP address
    #[arg(long)]
    new_ip: Option<String>,

    /// New admin password
    #[arg(long)]
    new_password: Option<String>,

    /// PAN-OS version to upgrade to
    #[arg(short, long)]
    target_version: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Device is already configured; connect at the new address directly
    #[arg(long)]
    skip_initial_config: bool,

    /// Print the upgrade path from this version and exit
    #[arg(long, value_name = "VERSION")]
    plan_from: Option<String>,

    /// Write the run state as JSON to this file
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG directives refine the --log-level default
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let directives = std::env::var("RUST_LOG").unwrap_or_default();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(level, &directives))
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("paprep v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        config::save_default_config(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;
    apply_overrides(&mut config, &args);

    let ladder = Ladder::from_config(&config.ladder).context("Invalid [ladder] configuration")?;

    if let Some(from) = &args.plan_from {
        return print_plan(from, &config, &ladder);
    }

    // Everything the operator typed is checked before the device is touched
    let setup = config
        .setup
        .to_input()
        .validate()
        .context("Invalid setup input")?;

    info!(
        factory = %config.device.factory_address,
        new_ip = %setup.new_ip,
        target = %setup.target_version,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe point");
            ctrl_c.cancel();
        }
    });

    let (event_tx, event_rx) = broadcast::channel(100);
    let printer = tokio::spawn(print_progress(event_rx));

    let result = run(
        &config,
        &ladder,
        &setup,
        args.skip_initial_config,
        &event_tx,
        cancel,
    )
    .await;

    drop(event_tx);
    let _ = printer.await;

    let Some(report) = result? else {
        println!("Device already runs PAN-OS {}", setup.target_version);
        return Ok(());
    };
    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }

    match report.result {
        OrchestrationResult::Completed => {
            println!(
                "Device at {} now runs PAN-OS {}",
                setup.new_ip, setup.target_version
            );
            Ok(())
        }
        OrchestrationResult::AbortedAt {
            hop_index,
            version,
            reason,
        } => {
            if let StepFailure::Session(e) = &reason {
                println!("Hint: {}", e.suggestion());
            }
            bail!(
                "Upgrade aborted at hop {} of {} ({}): {}",
                hop_index + 1,
                report.state.path.len(),
                version,
                reason
            )
        }
    }
}

fn log_filter(level: Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives)
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ip) = &args.new_ip {
        config.setup.new_ip = ip.clone();
    }
    if let Some(password) = &args.new_password {
        config.setup.new_password = password.clone();
    }
    if let Some(target) = &args.target_version {
        config.setup.target_version = target.clone();
    }
}

/// Resolve and print a path without contacting any device
fn print_plan(from: &str, config: &Config, ladder: &Ladder) -> Result<()> {
    let current = Version::parse(from)?;
    let target = Version::parse(&config.setup.target_version)
        .context("A target version is required (--target-version)")?;
    let path = resolve(&current, &target, ladder)?;

    println!("Upgrade path from {} to {} ({} hops):", current, target, path.len());
    for (i, version) in path.iter().enumerate() {
        println!("  {}. {}", i + 1, version);
    }
    Ok(())
}

/// Configure the device if needed, then upgrade it
///
/// Returns `None` when the device already runs the target.
async fn run(
    config: &Config,
    ladder: &Ladder,
    setup: &ValidatedSetup,
    skip_initial_config: bool,
    events: &broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
) -> Result<Option<RunReport>> {
    if skip_initial_config {
        info!("Skipping initial configuration");
    } else {
        provision_factory_device(config, setup).await?;
    }

    let endpoint = Endpoint::new(setup.new_ip.to_string(), config.device.port);
    let credentials = Credentials::new(
        config.device.username.clone(),
        setup.new_password.expose_secret(),
    );
    let mut session = DeviceSession::new(
        ShellTransport::new(),
        endpoint,
        credentials,
        config.timing.session_timeouts(),
    );

    session
        .wait_until_reachable(config.timing.new_address_policy(), &cancel)
        .await
        .map_err(|e| session_failure("Connecting at the new address", e))?;
    info!("Licensing and content updates are not managed; assuming they are current");

    let orchestrator = Orchestrator::new(
        ladder,
        &config.commands,
        config.timing.executor_timings(),
        events,
        cancel,
    );
    let result = orchestrator
        .run_from_device(&mut session, &setup.target_version)
        .await;
    session.disconnect().await;

    match result {
        Ok(report) => Ok(Some(report)),
        Err(RunError::Path(PathError::AlreadyCurrentOrDowngrade { current, target }))
            if current == target =>
        {
            Ok(None)
        }
        Err(RunError::Path(e)) => Err(anyhow!(e).context("No usable upgrade path")),
        Err(RunError::RunningVersion(StepFailure::Session(e))) => {
            Err(session_failure("Reading the running version", e))
        }
        Err(e) => Err(e.into()),
    }
}

async fn provision_factory_device(config: &Config, setup: &ValidatedSetup) -> Result<()> {
    let endpoint = Endpoint::new(config.device.factory_address.clone(), config.device.port);
    let credentials = Credentials::new(
        config.device.username.clone(),
        config.device.factory_password.clone(),
    );
    let mut factory = DeviceSession::new(
        ShellTransport::new(),
        endpoint,
        credentials,
        config.timing.session_timeouts(),
    );

    factory
        .connect()
        .await
        .map_err(|e| session_failure("Connecting to the factory address", e))?;
    let result =
        provision::apply_initial_config(&mut factory, setup, config.timing.commit_timeout()).await;
    factory.disconnect().await;

    result.context("Initial configuration failed")
}

fn session_failure(stage: &str, err: SessionError) -> anyhow::Error {
    error!(suggestion = err.suggestion(), "{} failed", stage);
    anyhow::Error::new(err).context(format!("{} failed", stage))
}

async fn print_progress(mut events: broadcast::Receiver<ProgressEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!(
                "[{}/{}] {}",
                event.hop_index + 1,
                event.total_hops,
                event.message
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress output fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(&report.state)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!(path = %path.display(), run_id = %report.state.run_id, "Wrote run report");
    Ok(())
}
