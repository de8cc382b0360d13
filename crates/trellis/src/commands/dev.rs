//! Dev command - runs a project against a local event runtime.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use console::style;
use trellis_config::{DevConfig, DevOverrides};
use trellis_dev::{DevOptions, DevSession};

use super::Context;

/// Arguments for the dev command.
///
/// Flags override `TRELLIS_*` variables, `trellis.toml` and the profile.
#[derive(Args, Debug)]
pub struct DevArgs {
    /// Project directory
    #[arg(long, env = "TRELLIS_PROJECT_DIR", default_value = ".")]
    pub project: PathBuf,

    /// Entry file, relative to the project directory
    #[arg(long)]
    pub entry: Option<String>,

    /// Workflow to attach provider webhooks and trigger sync to
    #[arg(long)]
    pub workflow: Option<String>,

    /// Namespace on the backend
    #[arg(long)]
    pub namespace: Option<String>,

    /// Webhook listener port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Start the debugger endpoint
    #[arg(long)]
    pub debug: bool,

    /// Debugger endpoint port
    #[arg(long)]
    pub inspect_port: Option<u16>,

    /// Never prompt; fail when provider configuration is missing
    #[arg(long)]
    pub unattended: bool,
}

/// Run the dev command.
pub async fn run(args: DevArgs, ctx: &Context) -> Result<()> {
    let overrides = DevOverrides {
        entry: args.entry,
        workflow_id: args.workflow,
        namespace: args.namespace,
        port: args.port,
        inspect_port: args.inspect_port,
        config_dir: None,
    };
    let config = DevConfig::resolve(&args.project, &overrides)
        .with_context(|| format!("failed to load configuration for {}", args.project.display()))?;

    let dim = console::Style::new().dim();
    println!(
        "{} {}",
        style("trellis dev").bold().green(),
        dim.apply_to(config.project_dir.display())
    );
    println!("  {} {}", dim.apply_to("Entry:    "), config.entry);
    println!("  {} {}", dim.apply_to("Namespace:"), config.namespace);
    if let Some(workflow_id) = &config.workflow_id {
        println!("  {} {}", dim.apply_to("Workflow: "), workflow_id);
    }
    if ctx.verbose {
        for (key, from) in &config.sources {
            println!("  {} {key} from {from}", dim.apply_to("config"));
        }
    }
    println!();

    let options = DevOptions {
        debug: args.debug,
        unattended: args.unattended,
    };
    let mut session = DevSession::from_config(config, options)?;
    session.run_until_shutdown().await?;
    tracing::debug!("Dev command finished");
    Ok(())
}
