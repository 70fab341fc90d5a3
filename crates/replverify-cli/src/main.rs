//! replverify - replication consistency checker
//!
//! Writes tagged probe records to a primary time-series store and checks
//! that they show up on its read replica on time and in order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod host;

/// replverify - replication consistency checker
#[derive(Parser, Debug)]
#[command(name = "replverify")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "replverify.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one verification batch and print the report
    Run(commands::run::RunArgs),

    /// Show recent probe rows from the primary and the replica
    Readback(commands::readback::ReadbackArgs),

    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Run(args) => {
            // 0 = passed, 1 = failed. Setup errors also surface as 1
            // through anyhow.
            let exit_code = runtime()?.block_on(commands::run::run(&cli.config, &args))?;
            std::process::exit(i32::from(exit_code));
        },
        Commands::Readback(args) => {
            runtime()?.block_on(commands::readback::run(&cli.config, &args))
        },
        Commands::CheckConfig => commands::check_config::run(&cli.config),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}
