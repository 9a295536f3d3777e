use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use mailops_infra::config::{self, DEFAULT_CONFIG_FILE};

mod commands;

/// Scheduled maintenance jobs of the mailing application
#[derive(Parser, Debug)]
#[command(name = "mailops")]
#[command(about = "Scheduled maintenance jobs of the mailing application", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; a missing file falls back to defaults and environment
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Ask the external tools for verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the latest release of the application if one is available
    AutoUpdate,

    /// Run one bounce processing pass over the configured servers
    Bounce {
        /// Skip the job lock and tolerate overlapping passes (overrides `bounce.fast`)
        #[arg(long)]
        fast: Option<bool>,
    },

    /// Process a single bounce server; started by `bounce` in parallel mode
    #[command(hide = true)]
    BounceWorker {
        #[arg(long)]
        endpoint: u64,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "job aborted");
            eprintln!("mailops: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    mailops_observability::init_with(cfg.logging.format);

    let ctx = commands::Context {
        config_path: cli.config,
        verbose: cli.verbose,
        cfg,
    };

    match cli.command {
        Commands::AutoUpdate => commands::auto_update(&ctx),
        Commands::Bounce { fast } => commands::bounce(&ctx, fast),
        Commands::BounceWorker { endpoint } => commands::bounce_worker(&ctx, endpoint),
    }
}
