//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::WorkerKind;

/// Foreman - work-assignment scheduler for document workers
#[derive(Parser)]
#[command(
    name = "fm",
    about = "Work-assignment scheduler for collaborative document workers",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the effective configuration as YAML
    Config,

    /// Assign documents to a simulated pool, let them go idle and sweep
    Simulate {
        #[command(flatten)]
        pool: PoolArgs,

        /// Documents to open
        #[arg(short, long, default_value = "4")]
        documents: usize,

        /// Tenant owning the documents
        #[arg(short, long, default_value = "tenant-1")]
        tenant: String,

        /// Sweeps to run
        #[arg(short, long, default_value = "3")]
        sweeps: usize,
    },

    /// Broadcast an agent module to a simulated pool
    Broadcast {
        #[command(flatten)]
        pool: PoolArgs,

        /// Module to load or activate
        #[arg(short, long)]
        module: String,

        /// Worker class to target (server, client)
        #[arg(short, long, default_value = "server")]
        kind: WorkerKind,

        /// Action for the workers to take
        #[arg(short, long, default_value = "activate")]
        action: String,
    },

    /// Run the periodic sweep against a simulated pool until interrupted
    Serve {
        #[command(flatten)]
        pool: PoolArgs,

        /// Documents to open at startup
        #[arg(short, long, default_value = "4")]
        documents: usize,
    },
}

/// Simulated worker pool options
#[derive(Debug, clap::Args)]
pub struct PoolArgs {
    /// Server-class workers
    #[arg(long, default_value = "3")]
    pub server_workers: usize,

    /// Client-class workers
    #[arg(long, default_value = "1")]
    pub client_workers: usize,

    /// Probability (0.0-1.0) that a worker ignores or declines messages
    #[arg(long, default_value = "0.0")]
    pub flaky: f64,

    /// Override the acknowledgment timeout
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,
}
