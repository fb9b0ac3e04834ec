//! Edge provisioner entry point
//!
//! ## Usage
//!
//! ```bash
//! # Firewall, DNSSEC zones and certificates
//! edge-provision --config /etc/edge-provision.toml infra
//!
//! # Backend probes and proxy routing
//! edge-provision --config /etc/edge-provision.toml deploy
//!
//! # Show what would change without touching anything
//! edge-provision --dry-run infra
//!
//! # Read-only audit
//! edge-provision verify
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use edge_provisioner::{Config, Orchestrator, Phase, PhaseReport, RunOptions, Services};

const EXIT_FATAL: i32 = 2;

/// Declarative edge provisioner
#[derive(Parser, Debug)]
#[command(name = "edge-provision")]
#[command(author = "AEGIS Team")]
#[command(version)]
#[command(about = "Provision DNSSEC zones, certificates, proxy routing and packet filter", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long, default_value = "edge-provision.toml")]
    config: PathBuf,

    /// Enable debug logging (`RUST_LOG` takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Print planned actions without making changes
    #[arg(long)]
    dry_run: bool,

    /// Run the phase even if it already completed for this configuration
    #[arg(long)]
    force: bool,

    #[command(subcommand)]
    phase: PhaseCommand,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum PhaseCommand {
    /// Install the packet filter, sign zones and issue certificates
    Infra,
    /// Probe backends and install proxy routing
    Deploy,
    /// Remove artifacts of domains no longer configured
    Cleanup,
    /// Audit zones, certificates, routing and packet filter
    Verify,
}

impl From<PhaseCommand> for Phase {
    fn from(command: PhaseCommand) -> Self {
        match command {
            PhaseCommand::Infra => Phase::Infra,
            PhaseCommand::Deploy => Phase::Deploy,
            PhaseCommand::Cleanup => Phase::Cleanup,
            PhaseCommand::Verify => Phase::Verify,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let code = match run(args).await {
        Ok(report) => {
            print_summary(&report);
            report.exit_code()
        }
        Err(e) => {
            eprintln!("{} {:#}", "✗ Fatal:".red().bold(), e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<PhaseReport> {
    info!("Starting edge provisioner v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let services = Services::system(&config);
    let orchestrator = Orchestrator::new(config, services).context("invalid configuration")?;

    // Ctrl-C: let in-flight domains finish, start nothing new
    let interrupted = orchestrator.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work");
            interrupted.store(true, Ordering::SeqCst);
        }
    });

    let options = RunOptions {
        dry_run: args.dry_run,
        force: args.force,
    };
    let report = orchestrator.run(args.phase.into(), options).await?;
    Ok(report)
}

fn print_summary(report: &PhaseReport) {
    println!();
    let title = if report.dry_run {
        format!("Phase {} (dry run)", report.phase)
    } else {
        format!("Phase {}", report.phase)
    };
    println!("{}", title.bright_cyan().bold());

    if report.up_to_date {
        println!("{}", "✓ Already completed for this configuration (use --force to rerun)".green());
        return;
    }
    if let Some(reason) = &report.blocked {
        println!("{}", format!("✗ Blocked: {}", reason).red().bold());
    }

    for action in &report.actions {
        let marker = if report.dry_run { "•" } else { "✓" };
        println!("  {} {}", marker, action);
    }
    for failure in report.rejected.iter().chain(&report.failed) {
        println!(
            "  {} {} [{}]: {}",
            "✗".red(),
            failure.domain.bold(),
            failure.component,
            failure.reason
        );
    }
    for deferred in &report.deferred {
        println!(
            "  {} {} [{}]: {}",
            "⏸".yellow(),
            deferred.domain.bold(),
            deferred.component,
            deferred.reason
        );
    }

    println!(
        "{} succeeded, {} failed, {} deferred, {} skipped",
        report.succeeded.len().to_string().green(),
        report.failed.len().to_string().red(),
        report.deferred.len().to_string().yellow(),
        report.skipped.len().to_string().yellow()
    );
    if !report.deferred.is_empty() {
        println!("{}", "⚠ Circuit breaker open; rerun after the cooldown to finish deferred work".yellow());
    }
    if report.interrupted {
        println!("{}", "⚠ Interrupted; rerun to resume from the checkpoint".yellow().bold());
    }
}
