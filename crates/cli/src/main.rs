//! Specwright CLI - Main Entry Point
//!
//! Runs test campaigns, validates plans and inspects the learning store.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use specwright_cli::commands::{self, config as config_cmd, learn, run, validate};
use specwright_cli::output::{self, OutputFormat};

/// Specwright - self-correcting test campaign runner
#[derive(Parser)]
#[command(name = "specwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.specwright/config.toml", global = true)]
    config: PathBuf,

    /// Store directory (learning database, evidence, reports)
    #[arg(long, global = true, env = "SPECWRIGHT_STORE")]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a campaign: dispatch tools, execute the suite, heal drift
    Run(run::RunArgs),

    /// Check a plan and its specs without running anything
    Validate(validate::ValidateArgs),

    /// Inspect the learning store
    #[command(subcommand)]
    Learn(learn::LearnCommands),

    /// Show or create the configuration file
    #[command(subcommand)]
    Config(config_cmd::ConfigCommands),
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    let config_path = commands::expand_home(&cli.config);
    let config = commands::load_config(&config_path, cli.store.as_deref())?;

    let code = match cli.command {
        Commands::Run(args) => run::execute(args, config, cli.format).await?,
        Commands::Validate(args) => validate::execute(args, &config, cli.format).await?,
        Commands::Learn(cmd) => {
            learn::execute(cmd, &config, cli.format).await?;
            0
        }
        Commands::Config(cmd) => {
            if let Err(e) = config_cmd::execute(cmd, &config_path, &config, cli.format) {
                output::print_error(&e.to_string());
                1
            } else {
                0
            }
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
