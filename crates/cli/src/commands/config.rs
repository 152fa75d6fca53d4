//! Config Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use specwright_engine::EngineConfig;
use std::path::Path;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(cmd: ConfigCommands, path: &Path, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Table => print!("{}", toml::to_string_pretty(config)?),
            _ => output::print_structured(config, format)?,
        },
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            EngineConfig::default().save(path)?;
            output::print_success(&format!("Wrote {}", path.display()));
        }
    }
    Ok(())
}
