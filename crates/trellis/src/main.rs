//! Trellis - local development runtime for workflow automations
//!
//! Main entry point for the Trellis CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::dev;

/// Trellis - local development runtime for workflow automations
#[derive(Parser)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a project locally with hot reload
    Dev(dev::DevArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "trellis=debug,trellis_dev=debug,trellis_runtime=debug,trellis_sandbox=debug,trellis_client=debug,trellis_config=debug,trellis_inspector=debug,info"
    } else {
        "trellis=info,trellis_dev=info,trellis_runtime=info,trellis_sandbox=info,trellis_inspector=info,warn"
    };

    let log_dir = trellis_config::log_dir().unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trellis.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(cli.verbose)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "trellis=trace,trellis_dev=trace,trellis_runtime=trace,trellis_sandbox=trace,trellis_client=trace,trellis_config=trace,trellis_inspector=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Dev(args) => dev::run(args, &ctx).await,
    }
}
