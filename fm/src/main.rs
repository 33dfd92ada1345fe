//! Foreman - work-assignment scheduler
//!
//! CLI entry point for inspecting configuration and driving simulated worker pools.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use foreman::cli::{Cli, Command, PoolArgs};
use foreman::sim::{PoolConfig, Simulation, WorkerBehavior};
use foreman::{BroadcastReport, Config, ForemanConfig, ManagerMetrics, SweepSummary, WorkerKind};

fn parse_level(level_str: Option<&str>) -> tracing::Level {
    match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, stderr: bool) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("foreman")
            .join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_file = fs::File::create(log_dir.join("foreman.log")).context("Failed to create log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.stderr)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;
    info!(
        ack_timeout_ms = config.foreman.ack_timeout_ms,
        document_timeout_ms = config.foreman.document_timeout_ms,
        "Foreman loaded config"
    );

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Config => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
        Command::Simulate {
            pool,
            documents,
            tenant,
            sweeps,
        } => {
            debug!(?pool, documents, %tenant, sweeps, "main: matched Simulate command");
            cmd_simulate(&config, &pool, &tenant, documents, sweeps).await
        }
        Command::Broadcast {
            pool,
            module,
            kind,
            action,
        } => {
            debug!(?pool, %module, %kind, %action, "main: matched Broadcast command");
            cmd_broadcast(&config, &pool, &module, kind, &action).await
        }
        Command::Serve { pool, documents } => {
            debug!(?pool, documents, "main: matched Serve command");
            cmd_serve(&config, &pool, documents).await
        }
    }
}

fn foreman_config(config: &Config, pool: &PoolArgs) -> ForemanConfig {
    let mut foreman = config.foreman.clone();
    if let Some(ack_timeout_ms) = pool.ack_timeout_ms {
        foreman.ack_timeout_ms = ack_timeout_ms;
    }
    foreman
}

fn start_pool(config: &Config, pool: &PoolArgs) -> Result<Simulation> {
    let pool_config = PoolConfig {
        server_workers: pool.server_workers,
        client_workers: pool.client_workers,
        flaky: pool.flaky,
    };
    let sim = Simulation::start(foreman_config(config, pool), &pool_config).context("Failed to start simulation")?;

    println!("{}", "Worker pool".bright_cyan().bold());
    for worker in sim.workers() {
        let behavior = match worker.behavior {
            WorkerBehavior::Cooperative => worker.behavior.to_string().green(),
            _ => worker.behavior.to_string().yellow(),
        };
        println!(
            "  {:<12} {:<7} {}",
            worker.detail.client_id.to_string(),
            worker.detail.kind.to_string(),
            behavior
        );
    }
    println!();
    Ok(sim)
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    print!("{}", config.to_yaml()?);
    Ok(())
}

/// Run sweeps over a simulated pool whose documents have all gone idle
async fn cmd_simulate(config: &Config, pool: &PoolArgs, tenant: &str, documents: usize, sweeps: usize) -> Result<()> {
    debug!(documents, sweeps, "cmd_simulate: called");
    let mut sim = start_pool(config, pool)?;
    let bound = sim.assign_documents(tenant, documents)?;
    println!("Assigned {} tasks across {} documents", bound, documents);
    println!();

    for (n, summary) in sim.run_sweeps(sweeps).await.iter().enumerate() {
        print_sweep(n + 1, summary);
    }

    let metrics = sim.shutdown().await;
    println!();
    print_metrics(&metrics);
    Ok(())
}

async fn cmd_broadcast(config: &Config, pool: &PoolArgs, module: &str, kind: WorkerKind, action: &str) -> Result<()> {
    debug!(%module, %kind, %action, "cmd_broadcast: called");
    let sim = start_pool(config, pool)?;
    let report = sim.broadcast(module, kind, action).await;
    print_broadcast(module, kind, &report);
    sim.shutdown().await;
    Ok(())
}

/// Run the periodic sweep until SIGINT or SIGTERM
async fn cmd_serve(config: &Config, pool: &PoolArgs, documents: usize) -> Result<()> {
    debug!(documents, "cmd_serve: called");
    let mut sim = start_pool(config, pool)?;
    sim.assign_documents("tenant-1", documents)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let runner = tokio::spawn(Arc::clone(sim.foreman()).run(shutdown_rx));
    println!(
        "Sweeping every {}ms. Press Ctrl+C to stop.",
        sim.foreman().config().sweep_interval_ms
    );

    // Set up signal handlers
    debug!("cmd_serve: setting up signal handlers");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                debug!("cmd_serve: SIGINT received, initiating shutdown");
                warn!("SIGINT received");
            }
            _ = sigterm.recv() => {
                debug!("cmd_serve: SIGTERM received, initiating shutdown");
                warn!("SIGTERM received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        debug!("cmd_serve: waiting for ctrl_c (non-Unix)");
        tokio::signal::ctrl_c().await?;
    }

    let _ = shutdown_tx.send(()).await;
    runner.await.context("Foreman task failed")?;

    let metrics = sim.shutdown().await;
    println!();
    print_metrics(&metrics);
    Ok(())
}

fn print_sweep(n: usize, summary: &SweepSummary) {
    if summary.is_empty() {
        println!("Sweep {}: {}", n, "nothing expired".dimmed());
        return;
    }
    println!(
        "Sweep {}: {} revoked, {} already released, {} failed, {} evicted",
        n,
        summary.revoked.to_string().green(),
        summary.already_released,
        summary.failed.to_string().red(),
        summary.evicted.to_string().yellow(),
    );
}

fn print_broadcast(module: &str, kind: WorkerKind, report: &BroadcastReport) {
    println!("{}", format!("Broadcast '{}' to {} workers", module, kind).bright_cyan().bold());
    println!("  Workers:   {}", report.workers);
    println!("  Acked:     {}", report.acked.to_string().green());
    println!("  Nacked:    {}", report.nacked.to_string().red());
    println!("  Timed out: {}", report.timed_out.to_string().yellow());
}

fn print_metrics(metrics: &ManagerMetrics) {
    println!("{}", "State".bright_cyan().bold());
    println!("  Live assignments: {}", metrics.assignments);
    println!("  Total binds:      {}", metrics.total_binds);
    println!("  Total removals:   {}", metrics.total_removals);
    println!("  Total evictions:  {}", metrics.total_evictions);
}
